//! Rendezvous point between the pattern sequencer and the acquirers.
//!
//! The sequencer arms a cycle for the pattern it is showing, every acquirer
//! saves one frame for that cycle and reports it, and the sequencer waits
//! until the expected number of reports arrived. All cycle state sits behind
//! one mutex so reads and increments can never interleave with a re-arm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One arming of the coordinator.
///
/// The generation tells two arms of the same index apart, so a report for an
/// earlier cycle is never counted toward a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cycle {
    pub index: usize,
    pub generation: u64,
}

/// How a wait for cycle completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed,
    Cancelled,
    TimedOut { saved: usize, expected: usize },
}

#[derive(Debug, Default)]
struct CycleState {
    active_index: usize,
    armed: bool,
    completed: usize,
    expected: usize,
    generation: u64,
}

/// Shared capture cycle state.
#[derive(Debug)]
pub struct CaptureCoordinator {
    state: Mutex<CycleState>,
    completed: Condvar,
    poll: Duration,
}

impl Default for CaptureCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl CaptureCoordinator {
    /// `poll` bounds how long a waiter goes without checking cancellation.
    pub fn new(poll: Duration) -> Self {
        Self {
            state: Mutex::new(CycleState::default()),
            completed: Condvar::new(),
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Arm capture for pattern `index`, expecting `expected` reports.
    pub fn arm(&self, index: usize, expected: usize) -> Cycle {
        let mut state = self.state.lock();
        state.generation += 1;
        state.active_index = index;
        state.completed = 0;
        state.expected = expected;
        state.armed = true;
        log::debug!("Armed pattern {} (generation {})", index, state.generation);
        Cycle {
            index,
            generation: state.generation,
        }
    }

    /// Stop accepting reports. Safe to call repeatedly.
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        if state.armed {
            log::debug!(
                "Disarmed pattern {} ({}/{} saved)",
                state.active_index,
                state.completed,
                state.expected
            );
        }
        state.armed = false;
    }

    /// The cycle currently armed, if any.
    pub fn armed_cycle(&self) -> Option<Cycle> {
        let state = self.state.lock();
        state.armed.then_some(Cycle {
            index: state.active_index,
            generation: state.generation,
        })
    }

    pub fn is_armed_for(&self, index: usize) -> bool {
        let state = self.state.lock();
        state.armed && state.active_index == index
    }

    /// Count a saved frame for `cycle`.
    ///
    /// Returns `false` without counting when `cycle` is no longer the armed
    /// one.
    pub fn report_saved(&self, cycle: Cycle) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.generation != cycle.generation {
            log::debug!(
                "Ignoring stale report for pattern {} (generation {})",
                cycle.index,
                cycle.generation
            );
            return false;
        }

        state.completed += 1;
        if state.completed >= state.expected {
            self.completed.notify_all();
        }
        true
    }

    /// Reports counted for the current cycle.
    pub fn completed_count(&self) -> usize {
        self.state.lock().completed
    }

    /// Block until `expected` reports arrived for the armed cycle, `cancel`
    /// fires, or `timeout` elapses.
    pub fn await_completion(
        &self,
        expected: usize,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> CompletionOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.completed >= expected {
                return CompletionOutcome::Completed;
            }
            if cancel.is_cancelled() {
                return CompletionOutcome::Cancelled;
            }

            let mut slice = self.poll;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return CompletionOutcome::TimedOut {
                        saved: state.completed,
                        expected,
                    };
                }
                slice = slice.min(deadline - now);
            }

            self.completed.wait_for(&mut state, slice);
        }
    }
}

/// Cooperative cancellation shared by the sequencer and every acquirer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `duration` in `slice` steps. Returns `false` if cancelled
    /// before the full duration elapsed.
    pub fn sleep(&self, duration: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let slice = slice.max(Duration::from_millis(1));
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    ready: usize,
    failed: usize,
    released: bool,
    aborted: bool,
}

/// Holds acquirers until every camera finished hardware setup.
#[derive(Debug, Default)]
pub struct StartGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Result of waiting on a [`StartGate`] from the session side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    AllReady,
    Failed { ready: usize, failed: usize },
    TimedOut { ready: usize },
    Cancelled,
}

impl StartGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.state.lock().ready += 1;
        self.changed.notify_all();
    }

    pub fn mark_failed(&self) {
        self.state.lock().failed += 1;
        self.changed.notify_all();
    }

    /// Let every waiting acquirer start its capture loop.
    pub fn release(&self) {
        self.state.lock().released = true;
        self.changed.notify_all();
    }

    /// Send every waiting acquirer to shutdown instead.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Acquirer side: block until released (`true`) or aborted (`false`).
    pub fn wait_released(&self, cancel: &CancelToken, poll: Duration) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.aborted || cancel.is_cancelled() {
                return false;
            }
            if state.released {
                return true;
            }
            self.changed.wait_for(&mut state, poll);
        }
    }

    /// Session side: wait until `count` acquirers reported in.
    pub fn wait_all_ready(
        &self,
        count: usize,
        cancel: &CancelToken,
        timeout: Duration,
        poll: Duration,
    ) -> GateOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.failed > 0 {
                return GateOutcome::Failed {
                    ready: state.ready,
                    failed: state.failed,
                };
            }
            if state.ready >= count {
                return GateOutcome::AllReady;
            }
            if cancel.is_cancelled() {
                return GateOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return GateOutcome::TimedOut { ready: state.ready };
            }
            self.changed.wait_for(&mut state, poll.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn test_arm_resets_count() {
        let coordinator = CaptureCoordinator::new(POLL);
        let first = coordinator.arm(0, 2);
        assert!(coordinator.report_saved(first));
        assert_eq!(coordinator.completed_count(), 1);

        coordinator.disarm();
        let second = coordinator.arm(1, 2);
        assert_eq!(coordinator.completed_count(), 0);
        assert_ne!(first.generation, second.generation);
        assert!(coordinator.is_armed_for(1));
        assert!(!coordinator.is_armed_for(0));
    }

    #[test]
    fn test_stale_report_rejected() {
        let coordinator = CaptureCoordinator::new(POLL);
        let stale = coordinator.arm(3, 2);
        coordinator.disarm();
        assert!(!coordinator.report_saved(stale));

        // Same index armed again is still a different cycle.
        let current = coordinator.arm(3, 2);
        assert!(!coordinator.report_saved(stale));
        assert_eq!(coordinator.completed_count(), 0);
        assert!(coordinator.report_saved(current));
        assert_eq!(coordinator.completed_count(), 1);
    }

    #[test]
    fn test_disarm_idempotent() {
        let coordinator = CaptureCoordinator::new(POLL);
        coordinator.disarm();
        coordinator.arm(0, 1);
        coordinator.disarm();
        coordinator.disarm();
        assert!(coordinator.armed_cycle().is_none());
    }

    #[test]
    fn test_await_returns_after_all_reports() {
        let coordinator = Arc::new(CaptureCoordinator::new(POLL));
        let cycle = coordinator.arm(0, 2);
        let cancel = CancelToken::new();

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * (i + 1)));
                    coordinator.report_saved(cycle)
                })
            })
            .collect();

        let outcome = coordinator.await_completion(2, &cancel, Some(Duration::from_secs(5)));
        assert_eq!(outcome, CompletionOutcome::Completed);
        assert_eq!(coordinator.completed_count(), 2);
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_await_one_report_is_not_enough() {
        let coordinator = CaptureCoordinator::new(POLL);
        let cycle = coordinator.arm(0, 2);
        coordinator.report_saved(cycle);
        let outcome =
            coordinator.await_completion(2, &CancelToken::new(), Some(Duration::from_millis(30)));
        assert_eq!(
            outcome,
            CompletionOutcome::TimedOut {
                saved: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn test_cancel_unblocks_await() {
        let coordinator = Arc::new(CaptureCoordinator::new(POLL));
        coordinator.arm(0, 2);
        let cancel = CancelToken::new();

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            })
        };

        let start = Instant::now();
        let outcome = coordinator.await_completion(2, &cancel, None);
        assert_eq!(outcome, CompletionOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
        canceller.join().unwrap();
    }

    #[test]
    fn test_cancel_token_sleep() {
        let cancel = CancelToken::new();
        assert!(cancel.sleep(Duration::from_millis(5), POLL));
        cancel.cancel();
        let start = Instant::now();
        assert!(!cancel.sleep(Duration::from_secs(10), POLL));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_start_gate_releases_all() {
        let gate = Arc::new(StartGate::new());
        let cancel = CancelToken::new();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let cancel = cancel.clone();
                thread::spawn(move || {
                    gate.mark_ready();
                    gate.wait_released(&cancel, POLL)
                })
            })
            .collect();

        assert_eq!(
            gate.wait_all_ready(2, &cancel, Duration::from_secs(5), POLL),
            GateOutcome::AllReady
        );
        gate.release();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_start_gate_failure_and_abort() {
        let gate = Arc::new(StartGate::new());
        let cancel = CancelToken::new();
        gate.mark_ready();
        gate.mark_failed();
        assert_eq!(
            gate.wait_all_ready(2, &cancel, Duration::from_secs(5), POLL),
            GateOutcome::Failed {
                ready: 1,
                failed: 1
            }
        );
        gate.abort();
        assert!(!gate.wait_released(&cancel, POLL));
    }

    #[test]
    fn test_start_gate_timeout() {
        let gate = StartGate::new();
        gate.mark_ready();
        assert_eq!(
            gate.wait_all_ready(2, &CancelToken::new(), Duration::from_millis(20), POLL),
            GateOutcome::TimedOut { ready: 1 }
        );
    }
}
