//! Capture synchronization engine.
//!
//! One [`FrameAcquirer`] thread per camera, a [`PatternSequencer`] on the
//! calling thread, and a [`CaptureCoordinator`] they rendezvous on.

pub mod acquirer;
pub mod artifact;
pub mod coordinator;
pub mod sequencer;
pub mod session;

pub use acquirer::{AcquirerError, AcquirerIdentity, AcquirerReport, AcquirerState, AcquirerStats, FrameAcquirer};
pub use artifact::{sequence_path, ArtifactLayout, OutputArtifact};
pub use coordinator::{CancelToken, CaptureCoordinator, CompletionOutcome, Cycle, GateOutcome, StartGate};
pub use sequencer::{PatternSequencer, SequenceOutcome, SequencerState};
pub use session::{CaptureSession, ManualCommand, RigBackends, RunOutcome, RunSummary};

use thiserror::Error;

use crate::camera::SourceError;
use crate::config::ConfigError;
use crate::projector::PatternError;
use crate::render::DisplayError;

/// Preconditions checked before anything is displayed or captured.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Patterns(#[from] PatternError),
    #[error("Display {index} requested but only {found} display(s) detected")]
    NotEnoughDisplays { index: usize, found: usize },
    #[error("Failed to enumerate cameras: {0}")]
    Enumerate(#[source] SourceError),
    #[error("{required} camera(s) required, {found} detected")]
    NotEnoughCameras { required: usize, found: usize },
    #[error("Camera '{name}' is assigned device {index}, but only {found} device(s) detected")]
    DeviceUnavailable { name: String, index: usize, found: usize },
    #[error(transparent)]
    Acquirer(#[from] AcquirerError),
    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Only {ready} of {expected} camera(s) became ready in time")]
    ReadyTimeout { ready: usize, expected: usize },
    #[error("Failed to open pattern display: {0}")]
    Display(#[source] DisplayError),
}

/// Capture failure.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Setup failed: {0}")]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Display(#[from] DisplayError),
    #[error("Pattern {index} stalled: {saved} of {expected} camera(s) saved a frame")]
    CycleStalled {
        index: usize,
        saved: usize,
        expected: usize,
    },
}
