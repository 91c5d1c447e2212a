//! Pattern sequencer: drives the projector and paces capture cycles.

use std::sync::Arc;

use super::coordinator::{CancelToken, CaptureCoordinator, CompletionOutcome};
use super::CaptureError;
use crate::config::TimingConfig;
use crate::projector::PatternSequence;
use crate::render::{DisplaySurface, SurfaceSignal};

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    /// Pattern is being drawn.
    Displaying(usize),
    /// Armed, waiting for every acquirer to save.
    Capturing(usize),
    /// Pattern captured, pausing before the next one.
    Settling(usize),
    Done,
    Aborted,
}

impl std::fmt::Display for SequencerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequencerState::Idle => write!(f, "Idle"),
            SequencerState::Displaying(i) => write!(f, "Displaying pattern {}", i),
            SequencerState::Capturing(i) => write!(f, "Capturing pattern {}", i),
            SequencerState::Settling(i) => write!(f, "Settling after pattern {}", i),
            SequencerState::Done => write!(f, "Done"),
            SequencerState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// How a sequence run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    Completed { patterns: usize },
    Aborted { captured: usize },
}

/// Shows each pattern, waits for every acquirer to save it, then settles.
pub struct PatternSequencer {
    coordinator: Arc<CaptureCoordinator>,
    cancel: CancelToken,
    timing: TimingConfig,
    /// Reports required per pattern.
    expected: usize,
    state: SequencerState,
    captured: usize,
    total: usize,
}

impl PatternSequencer {
    pub fn new(
        coordinator: Arc<CaptureCoordinator>,
        cancel: CancelToken,
        timing: TimingConfig,
        expected: usize,
    ) -> Self {
        Self {
            coordinator,
            cancel,
            timing,
            expected,
            state: SequencerState::Idle,
            captured: 0,
            total: 0,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Patterns captured so far and the sequence length.
    pub fn progress(&self) -> (usize, usize) {
        (self.captured, self.total)
    }

    fn set_state(&mut self, state: SequencerState) {
        log::debug!("Sequencer: {} -> {}", self.state, state);
        self.state = state;
    }

    fn abort(&mut self, reason: &str) -> SequenceOutcome {
        self.coordinator.disarm();
        log::warn!(
            "Sequence aborted after {}/{} patterns: {}",
            self.captured,
            self.total,
            reason
        );
        self.set_state(SequencerState::Aborted);
        SequenceOutcome::Aborted {
            captured: self.captured,
        }
    }

    /// True when a close request is pending.
    fn close_requested(surface: &mut dyn DisplaySurface) -> bool {
        surface
            .poll_signals()
            .into_iter()
            .any(|signal| signal == SurfaceSignal::CloseRequested)
    }

    /// Project every pattern of `patterns` on `surface`.
    pub fn run(
        &mut self,
        patterns: &PatternSequence,
        surface: &mut dyn DisplaySurface,
    ) -> Result<SequenceOutcome, CaptureError> {
        self.total = patterns.len();
        self.captured = 0;
        let poll = self.timing.poll();

        log::info!(
            "Starting sequence: {} patterns, {} camera(s)",
            self.total,
            self.expected
        );

        for index in 0..self.total {
            if self.cancel.is_cancelled() {
                return Ok(self.abort("cancelled"));
            }
            if Self::close_requested(surface) {
                return Ok(self.abort("pattern window closed"));
            }

            self.set_state(SequencerState::Displaying(index));
            let image = patterns.load_image(index)?;
            surface.present(&image)?;
            log::info!(
                "Showing {} ({}/{}) {}",
                patterns.kind(index),
                index + 1,
                self.total,
                patterns.path(index).map(|p| p.display().to_string()).unwrap_or_default()
            );

            if !self.timing.pre_capture().is_zero() && !self.cancel.sleep(self.timing.pre_capture(), poll) {
                return Ok(self.abort("cancelled"));
            }

            self.set_state(SequencerState::Capturing(index));
            self.coordinator.arm(index, self.expected);
            let outcome = self.coordinator.await_completion(
                self.expected,
                &self.cancel,
                self.timing.completion_timeout(),
            );
            self.coordinator.disarm();

            match outcome {
                CompletionOutcome::Completed => {}
                CompletionOutcome::Cancelled => return Ok(self.abort("cancelled")),
                CompletionOutcome::TimedOut { saved, expected } => {
                    self.set_state(SequencerState::Aborted);
                    return Err(CaptureError::CycleStalled {
                        index,
                        saved,
                        expected,
                    });
                }
            }
            self.captured += 1;

            if Self::close_requested(surface) {
                return Ok(self.abort("pattern window closed"));
            }

            if index + 1 < self.total {
                self.set_state(SequencerState::Settling(index));
                if !self.settle(surface) {
                    return Ok(self.abort("cancelled while settling"));
                }
            }
        }

        self.set_state(SequencerState::Done);
        log::info!("Sequence complete: {} patterns captured", self.captured);
        Ok(SequenceOutcome::Completed {
            patterns: self.captured,
        })
    }

    /// Wait out the settle interval in poll slices. Returns `false` when
    /// cancelled or the window was closed.
    fn settle(&mut self, surface: &mut dyn DisplaySurface) -> bool {
        let settle = self.timing.settle();
        let poll = self.timing.poll();
        let deadline = std::time::Instant::now() + settle;

        loop {
            if Self::close_requested(surface) {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            if !self.cancel.sleep(poll.min(deadline - now), poll) {
                return false;
            }
        }
    }
}
