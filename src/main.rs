//! Structured-light capture tool
//!
//! Entry point for the scan-capture command line.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::Sender;

use scan_capture::capture::{CancelToken, CaptureSession, ManualCommand, RigBackends};
use scan_capture::config::RigConfig;
use scan_capture::projector::GrayCodeGenerator;
use scan_capture::render::SurfaceControl;

#[derive(Parser)]
#[command(author, version, about = "Structured-light pattern projection and synchronized capture")]
struct Cli {
    /// Rig configuration file (JSON).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Project the pattern sequence and capture it with every camera.
    Run {
        /// Pattern directory.
        #[arg(long)]
        patterns: Option<PathBuf>,
        /// Output root.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Settle time after each pattern, in milliseconds.
        #[arg(long)]
        settle_ms: Option<u64>,
        #[arg(long, value_enum, default_value_t = Backend::Synthetic)]
        backend: Backend,
    },
    /// Save a frame group from every camera on each 's' typed on stdin.
    Manual {
        /// Output root.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Capture with only the named camera.
        #[arg(long)]
        single: Option<String>,
        #[arg(long, value_enum, default_value_t = Backend::Synthetic)]
        backend: Backend,
    },
    /// Write a Gray code pattern set.
    Generate {
        #[arg(long, default_value_t = 1920)]
        width: u32,
        #[arg(long, default_value_t = 1080)]
        height: u32,
        #[arg(long, default_value = "graycode")]
        output: PathBuf,
    },
    /// Write the default rig configuration.
    InitConfig {
        #[arg(default_value = "rig.json")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Loopback cameras filming a virtual projector.
    Synthetic,
    /// USB video class cameras (requires the `uvc` feature).
    Uvc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let mut config = match &cli.config {
        Some(path) => RigConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RigConfig::default(),
    };

    match cli.command {
        Command::Run {
            patterns,
            output,
            settle_ms,
            backend,
        } => {
            if let Some(patterns) = patterns {
                config.pattern_dir = patterns;
            }
            if let Some(output) = output {
                config.output_root = output;
            }
            if let Some(settle_ms) = settle_ms {
                config.timing.settle_ms = settle_ms;
            }

            let (backends, control) = build_backends(&config, backend)?;
            let session = CaptureSession::new(config, backends);
            spawn_stdin_control(session.cancel_token(), control, None);

            log::info!("Press 'q' + Enter to abort");
            let summary = session.run_sequence().context("capture run failed")?;
            summary.log();
        }
        Command::Manual {
            output,
            single,
            backend,
        } => {
            if let Some(output) = output {
                config.output_root = output;
            }
            if let Some(name) = single {
                config.cameras.retain(|slot| slot.name == name);
                if config.cameras.is_empty() {
                    bail!("no camera named '{}' in the configuration", name);
                }
            }

            let (backends, control) = build_backends(&config, backend)?;
            let session = CaptureSession::new(config, backends);
            let (tx, rx) = crossbeam_channel::unbounded();
            spawn_stdin_control(session.cancel_token(), control, Some(tx));

            let summary = session.run_manual(rx).context("manual capture failed")?;
            summary.log();
        }
        Command::Generate {
            width,
            height,
            output,
        } => {
            let generator = GrayCodeGenerator::new(width, height);
            generator
                .write_set(&output)
                .with_context(|| format!("writing patterns to {}", output.display()))?;
        }
        Command::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            RigConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            log::info!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

fn build_backends(config: &RigConfig, backend: Backend) -> anyhow::Result<(RigBackends, SurfaceControl)> {
    let (backends, control) = RigBackends::synthetic(config);
    match backend {
        Backend::Synthetic => Ok((backends, control)),
        Backend::Uvc => uvc_backends(backends, control),
    }
}

#[cfg(feature = "uvc")]
fn uvc_backends(
    mut backends: RigBackends,
    control: SurfaceControl,
) -> anyhow::Result<(RigBackends, SurfaceControl)> {
    backends.cameras = std::sync::Arc::new(scan_capture::camera::UvcCameraProvider);
    log::warn!(
        "No physical display is driven: patterns are rendered to an in-memory canvas only"
    );
    Ok((backends, control))
}

#[cfg(not(feature = "uvc"))]
fn uvc_backends(
    _backends: RigBackends,
    _control: SurfaceControl,
) -> anyhow::Result<(RigBackends, SurfaceControl)> {
    bail!("built without UVC support, rebuild with `--features uvc`")
}

/// One line typed on stdin.
#[derive(Debug, PartialEq, Eq)]
enum ControlInput {
    Quit,
    Save,
    Blank,
    Unknown(String),
}

/// `q` quits, `s` saves, in either case.
fn parse_control(line: &str) -> ControlInput {
    let line = line.trim();
    if line.eq_ignore_ascii_case("q") {
        ControlInput::Quit
    } else if line.eq_ignore_ascii_case("s") {
        ControlInput::Save
    } else if line.is_empty() {
        ControlInput::Blank
    } else {
        ControlInput::Unknown(line.to_string())
    }
}

/// Read operator commands from stdin: `q` aborts, `s` saves a manual group.
fn spawn_stdin_control(cancel: CancelToken, control: SurfaceControl, manual: Option<Sender<ManualCommand>>) {
    let spawned = std::thread::Builder::new()
        .name("stdin-control".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_control(&line) {
                    ControlInput::Quit => {
                        log::info!("Quit requested");
                        match &manual {
                            Some(tx) => {
                                let _ = tx.send(ManualCommand::Quit);
                            }
                            None => {
                                control.request_close();
                                cancel.cancel();
                            }
                        }
                        break;
                    }
                    ControlInput::Save => match &manual {
                        Some(tx) => {
                            let _ = tx.send(ManualCommand::Capture);
                        }
                        None => log::warn!("'s' is only available in manual mode"),
                    },
                    ControlInput::Blank => {}
                    ControlInput::Unknown(other) => log::warn!("Unknown command '{}'", other),
                }
            }
        });

    if let Err(e) = spawned {
        log::warn!("Failed to start stdin control: {}", e);
    }
}
