use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use rtkbt_rs::firmware::log_progress;
use rtkbt_rs::logging;
use rtkbt_rs::{
    bring_up, Adapter, BringupError, CancelToken, HciProbe, LoadError, SerialTransport, Settings,
    Supervisor, EXIT_GENERIC,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const ACTION_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "rtkbt-attach",
    about = "Bring up a Realtek Bluetooth controller on a three-wire UART"
)]
struct Args {
    /// UART device node (e.g., /dev/ttyS5)
    #[arg(env = "RTKBT_DEVICE")]
    device: Option<String>,
    /// Line speed the controller boots at
    #[arg(short = 's', long = "speed")]
    initial_speed: Option<u32>,
    /// Line speed to switch to after firmware download
    #[arg(short = 't', long = "target-speed")]
    target_speed: Option<u32>,
    /// Stay in the foreground and supervise links after bring-up
    #[arg(short = 'n', long)]
    no_detach: bool,
    /// Directory holding the firmware image and config blob
    #[arg(long, env = "RTKBT_FIRMWARE_DIR")]
    firmware_dir: Option<PathBuf>,
    /// YAML settings file
    #[arg(long, env = "RTKBT_CONFIG")]
    config: Option<PathBuf>,
    /// Full restarts allowed after a failed attempt or a supervisor request
    #[arg(long, default_value_t = 5)]
    max_restarts: u32,
    /// Assume the link is already synchronised
    #[arg(long)]
    skip_handshake: bool,
    /// Log level (error, warn, info, debug, trace); defaults to RTKBT_LOG/RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
    /// Check liveness of this BlueZ adapter (e.g., hci0) instead of querying the UART
    #[cfg(feature = "bluez")]
    #[arg(long)]
    bluez_adapter: Option<String>,
}

fn main() {
    let args = Args::parse();
    match args.log_level.as_deref() {
        Some(level) => logging::init_with_level(logging::parse_level(Some(level))),
        None => logging::init_rust_logging(),
    }

    if let Err(e) = run(args) {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        let code = e
            .downcast_ref::<BringupError>()
            .map(BringupError::exit_code)
            .unwrap_or(EXIT_GENERIC);
        exit(code);
    }
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let bringup = &mut settings.bringup;
    if let Some(device) = &args.device {
        bringup.device = device.clone();
    }
    if let Some(speed) = args.initial_speed {
        bringup.initial_baud = speed;
    }
    if let Some(speed) = args.target_speed {
        bringup.target_baud = speed;
    }
    if let Some(dir) = &args.firmware_dir {
        bringup.firmware_dir = dir.clone();
    }
    bringup.skip_handshake |= args.skip_handshake;
    Ok(settings)
}

fn run(args: Args) -> Result<()> {
    let settings = load_settings(&args)?;
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        on_signal.cancel();
    })
    .context("Failed to install signal handler")?;

    info!(
        "bringing up {} ({} -> {} baud, firmware in {})",
        settings.bringup.device,
        settings.bringup.initial_baud,
        settings.bringup.target_baud,
        settings.bringup.firmware_dir.display()
    );

    let mut restarts = 0;
    loop {
        match bring_up(&settings.bringup, &settings.vendor, &cancel, log_progress) {
            Ok(adapter) => {
                if !args.no_detach {
                    info!("bring-up complete");
                    return Ok(());
                }
                if !supervise(adapter, &settings, &cancel, &args)? {
                    return Ok(());
                }
            }
            Err(e) if !is_retryable(&e) || restarts >= args.max_restarts => {
                return Err(e).context("Bring-up failed");
            }
            Err(e) => warn!("bring-up attempt {} failed: {}", restarts + 1, e),
        }

        if restarts >= args.max_restarts {
            anyhow::bail!("giving up after {} restarts", restarts);
        }
        restarts += 1;
        let delay = backoff(restarts);
        info!("restarting in {:?} ({}/{})", delay, restarts, args.max_restarts);
        cancel
            .sleep(delay)
            .map_err(BringupError::from)
            .context("Interrupted while waiting to restart")?;
    }
}

/// Failures another attempt cannot fix are reported immediately.
fn is_retryable(e: &BringupError) -> bool {
    !matches!(
        e,
        BringupError::Open { .. } | BringupError::Load(LoadError::InvalidImage(_) | LoadError::Io(_))
    ) && !e.is_cancelled()
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1 << attempt.saturating_sub(1).min(5))
        .min(BACKOFF_MAX)
}

/// Supervise until a stack restart is requested (`true`) or shutdown (`false`).
fn supervise(
    adapter: Adapter<SerialTransport>,
    settings: &Settings,
    cancel: &CancelToken,
    args: &Args,
) -> Result<bool> {
    let probe = HciProbe::new(Arc::clone(adapter.engine()), &settings.supervisor);
    #[cfg(feature = "bluez")]
    let probe = match &args.bluez_adapter {
        Some(name) => probe.with_liveness(Box::new(
            rtkbt_rs::bluez::BluezLiveness::new(Some(name.clone()))
                .context("Failed to start BlueZ runtime")?,
        )),
        None => probe,
    };
    #[cfg(not(feature = "bluez"))]
    let _ = args;

    let stop = CancelToken::new();
    let (tx, rx) = mpsc::channel();
    let handle = Supervisor::new(probe, settings.supervisor.clone())
        .spawn(tx, stop.clone())
        .context("Failed to start link supervisor")?;

    let restart = loop {
        if cancel.is_cancelled() {
            break false;
        }
        match rx.recv_timeout(ACTION_POLL) {
            Ok(action) if action.restarts_stack() => {
                warn!("supervisor requested restart: {:?}", action);
                break true;
            }
            Ok(action) => debug!("supervisor: {:?}", action),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break false,
        }
    };

    stop.cancel();
    if handle.join().is_err() {
        warn!("link supervisor thread panicked");
    }
    drop(adapter);
    Ok(restart)
}
