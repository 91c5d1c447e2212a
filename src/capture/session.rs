//! Capture session: setup, run and teardown of a whole rig.
//!
//! Setup checks every precondition (patterns, display, cameras) before any
//! directory is created or any pattern shown. Cameras are opened by their
//! acquirer threads and held at a start gate until all of them are ready.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::acquirer::{AcquirerContext, AcquirerIdentity, AcquirerReport, FrameAcquirer};
use super::artifact::ArtifactLayout;
use super::coordinator::{CancelToken, CaptureCoordinator, CompletionOutcome, GateOutcome, StartGate};
use super::sequencer::{PatternSequencer, SequenceOutcome};
use super::{CaptureError, SetupError};
use crate::camera::{CameraProvider, PixelConverter, StandardConverter, SyntheticCameraProvider};
use crate::config::RigConfig;
use crate::export::{DiskSink, FrameSink};
use crate::projector::PatternSequence;
use crate::render::{
    DisplayBackend, DisplaySurface, FramePreview, NullPreview, SharedCanvas, SurfaceControl,
    VirtualDisplayBackend,
};

/// External collaborators a session drives.
pub struct RigBackends {
    pub cameras: Arc<dyn CameraProvider>,
    pub displays: Box<dyn DisplayBackend>,
    pub sink: Arc<dyn FrameSink>,
    pub converter: Arc<dyn PixelConverter>,
    pub preview: Arc<dyn FramePreview>,
}

impl RigBackends {
    /// Loopback rig: virtual displays filmed by synthetic cameras.
    ///
    /// Also returns the control handle for the virtual pattern window.
    pub fn synthetic(config: &RigConfig) -> (Self, SurfaceControl) {
        let displays = VirtualDisplayBackend::new(&config.display.virtual_displays);
        let canvas: SharedCanvas = displays
            .canvas(config.display.index)
            .unwrap_or_else(|| Arc::new(parking_lot::RwLock::new(image::RgbImage::new(1, 1))));
        let cameras = SyntheticCameraProvider::new(canvas, config.synthetic.device_count)
            .with_format(config.synthetic.pixel_format)
            .with_frame_interval(Duration::from_millis(config.synthetic.frame_interval_ms));
        let control = displays.control();

        let backends = Self {
            cameras: Arc::new(cameras),
            displays: Box::new(displays),
            sink: Arc::new(DiskSink),
            converter: Arc::new(StandardConverter),
            preview: Arc::new(NullPreview),
        };
        (backends, control)
    }

    pub fn with_preview(mut self, preview: Arc<dyn FramePreview>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// Operator commands in manual capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualCommand {
    /// Save one frame from every camera as a new group.
    Capture,
    Quit,
}

/// How the wait for a manual group ended.
enum GroupWait {
    Done(CompletionOutcome),
    Quit,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Result of a capture run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Patterns (or manual groups) every camera saved.
    pub captured: usize,
    /// Sequence length, `None` in manual mode.
    pub planned: Option<usize>,
    pub output_root: PathBuf,
    pub acquirers: Vec<AcquirerReport>,
}

impl RunSummary {
    pub fn log(&self) {
        match self.planned {
            Some(planned) => log::info!(
                "Run {}: {}/{} patterns captured into {}",
                self.outcome,
                self.captured,
                planned,
                self.output_root.display()
            ),
            None => log::info!(
                "Run {}: {} group(s) captured into {}",
                self.outcome,
                self.captured,
                self.output_root.display()
            ),
        }
        for report in &self.acquirers {
            let s = &report.stats;
            log::info!(
                "[{}] pulled {}, saved {}, timeouts {}, pull errors {}, convert failures {}, save failures {}",
                report.name,
                s.frames_pulled,
                s.frames_saved,
                s.pull_timeouts,
                s.pull_errors,
                s.convert_failures,
                s.save_failures
            );
        }
    }
}

/// Acquirers past the start gate.
struct RunningRig {
    coordinator: Arc<CaptureCoordinator>,
    gate: Arc<StartGate>,
    acquirers: Vec<FrameAcquirer>,
}

/// One capture session over a rig.
///
/// A session runs once: teardown cancels its token.
pub struct CaptureSession {
    config: RigConfig,
    backends: RigBackends,
    cancel: CancelToken,
}

impl CaptureSession {
    pub fn new(config: RigConfig, backends: RigBackends) -> Self {
        Self {
            config,
            backends,
            cancel: CancelToken::new(),
        }
    }

    /// Token that cancels the session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Match every configured camera to an enumerated device.
    fn resolve_cameras(&self) -> Result<Vec<AcquirerIdentity>, SetupError> {
        let devices = self.backends.cameras.enumerate().map_err(SetupError::Enumerate)?;
        let required = self.config.cameras.len();
        log::info!("Detected {} camera(s), {} required", devices.len(), required);

        if devices.len() < required {
            return Err(SetupError::NotEnoughCameras {
                required,
                found: devices.len(),
            });
        }

        self.config
            .cameras
            .iter()
            .map(|slot| {
                let device = devices
                    .iter()
                    .find(|d| d.index == slot.device_index)
                    .cloned()
                    .ok_or_else(|| SetupError::DeviceUnavailable {
                        name: slot.name.clone(),
                        index: slot.device_index,
                        found: devices.len(),
                    })?;
                log::info!("[{}] using {}", slot.name, device.label());
                Ok(AcquirerIdentity {
                    name: slot.name.clone(),
                    device,
                })
            })
            .collect()
    }

    /// Spawn one acquirer per identity and wait until all are grabbing.
    fn start_acquirers(
        &self,
        identities: Vec<AcquirerIdentity>,
        layout: ArtifactLayout,
    ) -> Result<RunningRig, SetupError> {
        let timing = &self.config.timing;
        let coordinator = Arc::new(CaptureCoordinator::new(timing.poll()));
        let gate = Arc::new(StartGate::new());
        let context = AcquirerContext {
            coordinator: Arc::clone(&coordinator),
            gate: Arc::clone(&gate),
            cancel: self.cancel.clone(),
            converter: Arc::clone(&self.backends.converter),
            sink: Arc::clone(&self.backends.sink),
            preview: Arc::clone(&self.backends.preview),
            layout,
            output_root: self.config.output_root.clone(),
            output: self.config.output.clone(),
            settings: self.config.camera.clone(),
            frame_timeout: timing.frame_timeout(),
            poll: timing.poll(),
        };

        let expected = identities.len();
        let mut acquirers = Vec::with_capacity(expected);
        for identity in identities {
            match FrameAcquirer::spawn(identity, Arc::clone(&self.backends.cameras), context.clone()) {
                Ok(acquirer) => acquirers.push(acquirer),
                Err(e) => {
                    gate.abort();
                    drop(acquirers);
                    return Err(SetupError::Spawn(e));
                }
            }
        }

        let ready = match gate.wait_all_ready(expected, &self.cancel, timing.ready_timeout(), timing.poll()) {
            GateOutcome::AllReady | GateOutcome::Cancelled => None,
            GateOutcome::Failed { ready, .. } | GateOutcome::TimedOut { ready } => Some(ready),
        };

        if let Some(ready) = ready {
            gate.abort();
            // Prefer the camera's own error over the generic timeout.
            let mut first = None;
            for acquirer in acquirers {
                if let Err(e) = acquirer.join() {
                    first.get_or_insert(SetupError::Acquirer(e));
                }
            }
            return Err(first.unwrap_or(SetupError::ReadyTimeout { ready, expected }));
        }

        log::info!("All {} camera(s) ready", expected);
        Ok(RunningRig {
            coordinator,
            gate,
            acquirers,
        })
    }

    /// Stop every acquirer and collect their reports.
    fn stop_acquirers(&self, rig: RunningRig) -> Vec<AcquirerReport> {
        self.cancel.cancel();
        rig.gate.abort();
        rig.coordinator.disarm();
        rig.acquirers
            .into_iter()
            .filter_map(|acquirer| match acquirer.join() {
                Ok(report) => Some(report),
                Err(e) => {
                    log::error!("{}", e);
                    None
                }
            })
            .collect()
    }

    /// Project the pattern sequence and capture it with every camera.
    pub fn run_sequence(&self) -> Result<RunSummary, CaptureError> {
        self.config.validate().map_err(SetupError::from)?;
        let patterns = PatternSequence::load(&self.config.pattern_dir).map_err(SetupError::from)?;

        let displays = self.backends.displays.displays();
        let display = displays
            .get(self.config.display.index)
            .cloned()
            .ok_or(SetupError::NotEnoughDisplays {
                index: self.config.display.index,
                found: displays.len(),
            })?;
        let identities = self.resolve_cameras()?;
        let expected = identities.len();

        let rig = self.start_acquirers(
            identities,
            ArtifactLayout::Sequence {
                total: patterns.len(),
            },
        )?;
        if self.cancel.is_cancelled() {
            return Ok(self.aborted_summary(rig, 0, Some(patterns.len())));
        }

        let mut surface: Box<dyn DisplaySurface> = match self.backends.displays.open(&display) {
            Ok(surface) => surface,
            Err(e) => {
                self.stop_acquirers(rig);
                return Err(SetupError::Display(e).into());
            }
        };

        rig.gate.release();
        let mut sequencer = PatternSequencer::new(
            Arc::clone(&rig.coordinator),
            self.cancel.clone(),
            self.config.timing.clone(),
            expected,
        );
        let result = sequencer.run(&patterns, surface.as_mut());
        let (captured, _) = sequencer.progress();

        drop(surface);
        let reports = self.stop_acquirers(rig);

        let outcome = match result? {
            SequenceOutcome::Completed { .. } => RunOutcome::Completed,
            SequenceOutcome::Aborted { .. } => RunOutcome::Aborted,
        };
        Ok(RunSummary {
            outcome,
            captured,
            planned: Some(patterns.len()),
            output_root: self.config.output_root.clone(),
            acquirers: reports,
        })
    }

    /// Operator-triggered capture: every [`ManualCommand::Capture`] saves one
    /// numbered group from all cameras.
    pub fn run_manual(&self, commands: Receiver<ManualCommand>) -> Result<RunSummary, CaptureError> {
        self.config.validate().map_err(SetupError::from)?;
        let identities = self.resolve_cameras()?;
        let expected = identities.len();
        let layout = if expected == 1 {
            ArtifactLayout::Single
        } else {
            ArtifactLayout::Stereo
        };

        let rig = self.start_acquirers(identities, layout)?;
        rig.gate.release();
        log::info!("Manual capture ready: 's' saves a group, 'q' quits");

        let poll = self.config.timing.poll();
        let mut group = 0usize;
        let mut captured = 0usize;
        let mut queued = 0usize;
        let mut outcome = RunOutcome::Completed;

        loop {
            if self.cancel.is_cancelled() {
                outcome = RunOutcome::Aborted;
                break;
            }
            let command = if queued > 0 {
                queued -= 1;
                ManualCommand::Capture
            } else {
                match commands.recv_timeout(poll) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };
            if command == ManualCommand::Quit {
                break;
            }

            group += 1;
            rig.coordinator.arm(group, expected);
            let result = self.await_group(&rig.coordinator, expected, &commands, &mut queued);
            rig.coordinator.disarm();

            match result {
                GroupWait::Done(CompletionOutcome::Completed) => {
                    captured += 1;
                    log::info!("Group {:02} saved", group);
                }
                GroupWait::Done(CompletionOutcome::Cancelled) => {
                    outcome = RunOutcome::Aborted;
                    break;
                }
                GroupWait::Done(CompletionOutcome::TimedOut { saved, expected }) => {
                    log::warn!(
                        "Group {:02} incomplete: {} of {} camera(s) saved",
                        group,
                        saved,
                        expected
                    );
                }
                GroupWait::Quit => {
                    log::warn!("Group {:02} abandoned on quit", group);
                    break;
                }
            }
        }

        let reports = self.stop_acquirers(rig);
        Ok(RunSummary {
            outcome,
            captured,
            planned: None,
            output_root: self.config.output_root.clone(),
            acquirers: reports,
        })
    }

    /// Wait for a manual group in poll slices, watching `commands` so a quit
    /// is seen while cameras are still saving. Captures requested meanwhile
    /// are added to `queued`.
    fn await_group(
        &self,
        coordinator: &CaptureCoordinator,
        expected: usize,
        commands: &Receiver<ManualCommand>,
        queued: &mut usize,
    ) -> GroupWait {
        let poll = self.config.timing.poll();
        let deadline = self.config.timing.completion_timeout().map(|t| Instant::now() + t);

        loop {
            let slice = match deadline {
                Some(deadline) => poll.min(deadline.saturating_duration_since(Instant::now())),
                None => poll,
            };
            match coordinator.await_completion(expected, &self.cancel, Some(slice)) {
                CompletionOutcome::TimedOut { .. }
                    if deadline.map_or(true, |d| Instant::now() < d) => {}
                other => return GroupWait::Done(other),
            }

            for command in commands.try_iter() {
                match command {
                    ManualCommand::Quit => return GroupWait::Quit,
                    ManualCommand::Capture => *queued += 1,
                }
            }
        }
    }

    fn aborted_summary(&self, rig: RunningRig, captured: usize, planned: Option<usize>) -> RunSummary {
        log::warn!("Session cancelled before capture started");
        let reports = self.stop_acquirers(rig);
        RunSummary {
            outcome: RunOutcome::Aborted,
            captured,
            planned,
            output_root: self.config.output_root.clone(),
            acquirers: reports,
        }
    }
}
