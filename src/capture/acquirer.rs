//! Per-camera acquisition worker.
//!
//! Each [`FrameAcquirer`] runs on its own thread and owns its camera for the
//! thread's whole lifetime. It pulls frames continuously, previews them, and
//! persists exactly one frame per armed capture cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use super::artifact::ArtifactLayout;
use super::coordinator::{CancelToken, CaptureCoordinator, Cycle, StartGate};
use crate::camera::{CameraProvider, CameraSettings, DeviceInfo, FrameSource, PixelConverter, RawFrame, SourceError};
use crate::config::OutputConfig;
use crate::export::{ensure_dir, FrameSink};
use crate::render::FramePreview;

/// Back-off after a non-timeout pull error.
const PULL_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Stable identity of one acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquirerIdentity {
    /// Log label, preview label and output sub-directory.
    pub name: String,
    /// Camera this acquirer drives.
    pub device: DeviceInfo,
}

/// Acquirer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirerState {
    /// Hardware set up, waiting for the start gate.
    WaitingForStart,
    Running,
    Stopped,
}

impl std::fmt::Display for AcquirerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquirerState::WaitingForStart => write!(f, "Waiting for start"),
            AcquirerState::Running => write!(f, "Running"),
            AcquirerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Acquirer failure.
#[derive(Error, Debug)]
pub enum AcquirerError {
    #[error("[{name}] failed to {stage} {device}: {source}")]
    Setup {
        name: String,
        device: String,
        stage: &'static str,
        #[source]
        source: SourceError,
    },
    #[error("[{name}] acquisition thread panicked")]
    Panicked { name: String },
}

/// Counters collected over one acquirer's run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquirerStats {
    pub frames_pulled: u64,
    pub frames_saved: u64,
    pub pull_timeouts: u64,
    pub pull_errors: u64,
    pub convert_failures: u64,
    pub save_failures: u64,
}

/// Final report of one acquirer.
#[derive(Debug, Clone)]
pub struct AcquirerReport {
    pub name: String,
    pub stats: AcquirerStats,
}

/// Everything the acquirers of one session share.
#[derive(Clone)]
pub struct AcquirerContext {
    pub coordinator: Arc<CaptureCoordinator>,
    pub gate: Arc<StartGate>,
    pub cancel: CancelToken,
    pub converter: Arc<dyn PixelConverter>,
    pub sink: Arc<dyn FrameSink>,
    pub preview: Arc<dyn FramePreview>,
    pub layout: ArtifactLayout,
    pub output_root: PathBuf,
    pub output: OutputConfig,
    pub settings: CameraSettings,
    pub frame_timeout: Duration,
    pub poll: Duration,
}

/// State visible from outside the acquisition thread.
struct AcquirerShared {
    state: Mutex<AcquirerState>,
    frames_pulled: AtomicU64,
}

/// Handle to a running acquisition thread.
pub struct FrameAcquirer {
    name: String,
    shared: Arc<AcquirerShared>,
    thread_handle: Option<JoinHandle<Result<AcquirerStats, AcquirerError>>>,
}

impl FrameAcquirer {
    /// Spawn the acquisition thread. The camera is opened on that thread.
    pub fn spawn(
        identity: AcquirerIdentity,
        provider: Arc<dyn CameraProvider>,
        context: AcquirerContext,
    ) -> std::io::Result<Self> {
        let name = identity.name.clone();
        let shared = Arc::new(AcquirerShared {
            state: Mutex::new(AcquirerState::WaitingForStart),
            frames_pulled: AtomicU64::new(0),
        });

        let shared_clone = Arc::clone(&shared);
        let thread_handle = thread::Builder::new()
            .name(format!("acquirer-{}", name))
            .spawn(move || {
                let result = Worker::new(identity, context, Arc::clone(&shared_clone)).run(provider);
                *shared_clone.state.lock() = AcquirerState::Stopped;
                result
            })?;

        Ok(Self {
            name,
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AcquirerState {
        *self.shared.state.lock()
    }

    /// Frames pulled so far.
    pub fn frames_pulled(&self) -> u64 {
        self.shared.frames_pulled.load(Ordering::Relaxed)
    }

    /// Wait for the thread to exit. The caller must have cancelled the run or
    /// aborted the start gate first.
    pub fn join(mut self) -> Result<AcquirerReport, AcquirerError> {
        let name = self.name.clone();
        match self.thread_handle.take().map(JoinHandle::join) {
            Some(Ok(Ok(stats))) => Ok(AcquirerReport { name, stats }),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) | None => Err(AcquirerError::Panicked { name }),
        }
    }
}

impl Drop for FrameAcquirer {
    fn drop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Stops grabbing and closes the camera on every exit path.
struct GrabGuard {
    name: String,
    source: Box<dyn FrameSource>,
}

impl GrabGuard {
    fn pull_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        self.source.pull_frame(timeout)
    }
}

impl Drop for GrabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.source.stop_grab() {
            log::warn!("[{}] Failed to stop grabbing: {}", self.name, e);
        }
        if let Err(e) = self.source.close() {
            log::warn!("[{}] Failed to close camera: {}", self.name, e);
        }
        log::info!("[{}] Camera released", self.name);
    }
}

struct Worker {
    identity: AcquirerIdentity,
    context: AcquirerContext,
    shared: Arc<AcquirerShared>,
    stats: AcquirerStats,
    last_saved: Option<Cycle>,
}

impl Worker {
    fn new(identity: AcquirerIdentity, context: AcquirerContext, shared: Arc<AcquirerShared>) -> Self {
        Self {
            identity,
            context,
            shared,
            stats: AcquirerStats::default(),
            last_saved: None,
        }
    }

    fn name(&self) -> &str {
        &self.identity.name
    }

    fn setup_error(&self, stage: &'static str, source: SourceError) -> AcquirerError {
        AcquirerError::Setup {
            name: self.identity.name.clone(),
            device: self.identity.device.label(),
            stage,
            source,
        }
    }

    fn open(&self, provider: &dyn CameraProvider) -> Result<GrabGuard, AcquirerError> {
        let source = provider
            .open(&self.identity.device)
            .map_err(|e| self.setup_error("open", e))?;
        let mut guard = GrabGuard {
            name: self.identity.name.clone(),
            source,
        };

        guard
            .source
            .configure(&self.context.settings)
            .map_err(|e| self.setup_error("configure", e))?;
        guard
            .source
            .start_grab()
            .map_err(|e| self.setup_error("start grabbing on", e))?;

        log::info!(
            "[{}] {} grabbing at {}x{}",
            self.name(),
            self.identity.device.label(),
            self.context.settings.width,
            self.context.settings.height
        );
        Ok(guard)
    }

    fn run(mut self, provider: Arc<dyn CameraProvider>) -> Result<AcquirerStats, AcquirerError> {
        let mut guard = match self.open(provider.as_ref()) {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("{}", e);
                self.context.gate.mark_failed();
                return Err(e);
            }
        };

        self.context.gate.mark_ready();
        if !self
            .context
            .gate
            .wait_released(&self.context.cancel, self.context.poll)
        {
            log::info!("[{}] Start aborted", self.name());
            return Ok(self.stats);
        }

        *self.shared.state.lock() = AcquirerState::Running;
        log::info!("[{}] Capture loop started", self.name());

        while !self.context.cancel.is_cancelled() {
            // Only a frame pulled after the cycle was armed may be saved for it.
            let cycle = self.context.coordinator.armed_cycle();

            let raw = match guard.pull_frame(self.context.frame_timeout) {
                Ok(raw) => raw,
                Err(SourceError::Timeout) => {
                    self.stats.pull_timeouts += 1;
                    log::trace!("[{}] Frame pull timed out", self.name());
                    continue;
                }
                Err(e) => {
                    self.stats.pull_errors += 1;
                    log::warn!("[{}] Failed to pull frame: {}", self.name(), e);
                    thread::sleep(PULL_ERROR_BACKOFF);
                    continue;
                }
            };
            self.stats.frames_pulled += 1;
            self.shared.frames_pulled.fetch_add(1, Ordering::Relaxed);

            let image = match self.context.converter.convert(&raw) {
                Ok(image) => image,
                Err(e) => {
                    self.stats.convert_failures += 1;
                    log::warn!("[{}] Failed to convert frame {}: {}", self.name(), raw.frame_number, e);
                    continue;
                }
            };

            self.context.preview.show(self.name(), &image);

            if let Some(cycle) = cycle {
                if self.last_saved != Some(cycle) {
                    self.persist(cycle, &image);
                }
            }
        }

        self.context.preview.close(self.name());
        log::info!(
            "[{}] Capture loop stopped ({} frames, {} saved)",
            self.name(),
            self.stats.frames_pulled,
            self.stats.frames_saved
        );
        Ok(self.stats)
    }

    fn persist(&mut self, cycle: Cycle, image: &image::DynamicImage) {
        let artifact = self.context.layout.artifact(
            &self.context.output_root,
            self.name(),
            cycle.index,
            &self.context.output,
        );

        if let Err(e) = ensure_dir(artifact.dir()) {
            self.stats.save_failures += 1;
            log::error!(
                "[{}] Failed to create {}: {}",
                self.name(),
                artifact.dir().display(),
                e
            );
            return;
        }

        if let Err(e) = self.context.sink.save(&artifact.path, image, artifact.hint) {
            self.stats.save_failures += 1;
            log::error!("[{}] Failed to save {}: {}", self.name(), artifact.path.display(), e);
            return;
        }

        self.last_saved = Some(cycle);
        self.stats.frames_saved += 1;
        if self.context.coordinator.report_saved(cycle) {
            log::info!("[{}] Saved {}", self.name(), artifact.path.display());
        } else {
            log::debug!(
                "[{}] Saved {} after pattern {} was disarmed",
                self.name(),
                artifact.path.display(),
                cycle.index
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PixelFormat, StandardConverter};
    use crate::capture::coordinator::{CompletionOutcome, GateOutcome};
    use crate::export::{DiskSink, SaveError, SaveHint};
    use crate::render::{LatestFramePreview, NullPreview};
    use bytes::Bytes;
    use image::DynamicImage;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(5);

    /// Gray frames every couple of milliseconds, counts lifecycle calls.
    struct MockSource {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_configure: bool,
        frame_number: u64,
    }

    impl FrameSource for MockSource {
        fn configure(&mut self, _settings: &CameraSettings) -> Result<(), SourceError> {
            self.log.lock().push("configure");
            if self.fail_configure {
                return Err(SourceError::Configure {
                    param: "gamma",
                    reason: "unsupported".into(),
                });
            }
            Ok(())
        }

        fn start_grab(&mut self) -> Result<(), SourceError> {
            self.log.lock().push("start_grab");
            Ok(())
        }

        fn pull_frame(&mut self, _timeout: Duration) -> Result<RawFrame, SourceError> {
            thread::sleep(Duration::from_millis(2));
            self.frame_number += 1;
            if self.frame_number % 3 == 0 {
                return Err(SourceError::Timeout);
            }
            Ok(RawFrame {
                width: 4,
                height: 2,
                format: PixelFormat::Mono8,
                data: Bytes::from(vec![128u8; 8]),
                frame_number: self.frame_number,
                timestamp: Duration::ZERO,
            })
        }

        fn stop_grab(&mut self) -> Result<(), SourceError> {
            self.log.lock().push("stop_grab");
            Ok(())
        }

        fn close(&mut self) -> Result<(), SourceError> {
            self.log.lock().push("close");
            Ok(())
        }
    }

    struct MockProvider {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_configure: bool,
    }

    impl CameraProvider for MockProvider {
        fn enumerate(&self) -> Result<Vec<DeviceInfo>, SourceError> {
            Ok(vec![device()])
        }

        fn open(&self, _device: &DeviceInfo) -> Result<Box<dyn FrameSource>, SourceError> {
            self.log.lock().push("open");
            Ok(Box::new(MockSource {
                log: Arc::clone(&self.log),
                fail_configure: self.fail_configure,
                frame_number: 0,
            }))
        }
    }

    /// Sink that fails the first `failures` saves.
    struct FlakySink {
        failures: AtomicUsize,
        saved: AtomicUsize,
    }

    impl FrameSink for FlakySink {
        fn save(&self, path: &Path, image: &DynamicImage, hint: SaveHint) -> Result<(), SaveError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SaveError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.saved.fetch_add(1, Ordering::SeqCst);
            DiskSink.save(path, image, hint)
        }
    }

    fn device() -> DeviceInfo {
        DeviceInfo {
            index: 0,
            name: "Mock".into(),
            serial: None,
        }
    }

    fn context(root: &Path, sink: Arc<dyn FrameSink>, preview: Arc<dyn FramePreview>) -> AcquirerContext {
        AcquirerContext {
            coordinator: Arc::new(CaptureCoordinator::new(POLL)),
            gate: Arc::new(StartGate::new()),
            cancel: CancelToken::new(),
            converter: Arc::new(StandardConverter),
            sink,
            preview,
            layout: ArtifactLayout::Sequence { total: 3 },
            output_root: root.to_path_buf(),
            output: OutputConfig::default(),
            settings: CameraSettings::default(),
            frame_timeout: Duration::from_millis(50),
            poll: POLL,
        }
    }

    fn identity() -> AcquirerIdentity {
        AcquirerIdentity {
            name: "left".into(),
            device: device(),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(POLL);
        }
    }

    #[test]
    fn test_saves_once_per_cycle_and_releases_camera() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(MockProvider {
            log: Arc::clone(&log),
            fail_configure: false,
        });
        let sink = Arc::new(FlakySink {
            failures: AtomicUsize::new(0),
            saved: AtomicUsize::new(0),
        });
        let preview = Arc::new(LatestFramePreview::new());
        let ctx = context(dir.path(), sink.clone(), preview.clone());

        let acquirer = FrameAcquirer::spawn(identity(), provider, ctx.clone()).unwrap();
        assert_eq!(
            ctx.gate.wait_all_ready(1, &ctx.cancel, Duration::from_secs(5), POLL),
            GateOutcome::AllReady
        );
        ctx.gate.release();
        wait_until(|| acquirer.state() == AcquirerState::Running);

        ctx.coordinator.arm(0, 1);
        let outcome = ctx
            .coordinator
            .await_completion(1, &ctx.cancel, Some(Duration::from_secs(5)));
        assert_eq!(outcome, CompletionOutcome::Completed);

        // Keep the cycle armed for a while: no second save may happen.
        let pulled = acquirer.frames_pulled();
        wait_until(|| acquirer.frames_pulled() > pulled + 5);
        ctx.coordinator.disarm();
        assert_eq!(sink.saved.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("left").join("00.jpg").is_file());

        ctx.cancel.cancel();
        let report = acquirer.join().unwrap();
        assert_eq!(report.name, "left");
        assert_eq!(report.stats.frames_saved, 1);
        assert!(report.stats.pull_timeouts > 0);

        let calls = log.lock().clone();
        assert_eq!(calls, vec!["open", "configure", "start_grab", "stop_grab", "close"]);
        assert!(preview.slot("left").unwrap().closed);
    }

    #[test]
    fn test_failed_save_retried_on_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider {
            log: Arc::new(Mutex::new(Vec::new())),
            fail_configure: false,
        });
        let sink = Arc::new(FlakySink {
            failures: AtomicUsize::new(2),
            saved: AtomicUsize::new(0),
        });
        let ctx = context(dir.path(), sink.clone(), Arc::new(NullPreview));

        let acquirer = FrameAcquirer::spawn(identity(), provider, ctx.clone()).unwrap();
        ctx.gate.release();

        ctx.coordinator.arm(2, 1);
        let outcome = ctx
            .coordinator
            .await_completion(1, &ctx.cancel, Some(Duration::from_secs(5)));
        assert_eq!(outcome, CompletionOutcome::Completed);
        ctx.coordinator.disarm();
        ctx.cancel.cancel();

        let report = acquirer.join().unwrap();
        assert_eq!(report.stats.save_failures, 2);
        assert_eq!(report.stats.frames_saved, 1);
        assert!(dir.path().join("left").join("black_ref.png").is_file());
    }

    #[test]
    fn test_configure_failure_marks_gate_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(MockProvider {
            log: Arc::clone(&log),
            fail_configure: true,
        });
        let ctx = context(dir.path(), Arc::new(DiskSink), Arc::new(NullPreview));

        let acquirer = FrameAcquirer::spawn(identity(), provider, ctx.clone()).unwrap();
        assert!(matches!(
            ctx.gate.wait_all_ready(1, &ctx.cancel, Duration::from_secs(5), POLL),
            GateOutcome::Failed { ready: 0, failed: 1 }
        ));

        let err = acquirer.join().unwrap_err();
        assert!(matches!(err, AcquirerError::Setup { stage: "configure", .. }));
        assert_eq!(*log.lock(), vec!["open", "configure", "stop_grab", "close"]);
        assert!(!dir.path().join("left").exists());
    }

    #[test]
    fn test_gate_abort_stops_before_capture() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(MockProvider {
            log: Arc::clone(&log),
            fail_configure: false,
        });
        let ctx = context(dir.path(), Arc::new(DiskSink), Arc::new(NullPreview));

        let acquirer = FrameAcquirer::spawn(identity(), provider, ctx.clone()).unwrap();
        ctx.gate.wait_all_ready(1, &ctx.cancel, Duration::from_secs(5), POLL);
        ctx.gate.abort();

        let report = acquirer.join().unwrap();
        assert_eq!(report.stats.frames_pulled, 0);
        assert_eq!(log.lock().last(), Some(&"close"));
    }
}
