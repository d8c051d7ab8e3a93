//! One complete bring-up attempt: link, reset, firmware, speed, routing.

use std::sync::Arc;

use log::{error, info, warn};

use crate::config::{BringupConfig, VendorProfile};
use crate::errors::BringupError;
use crate::firmware::{ConfigBlob, FirmwareImage, FirmwareLoader, Progress};
use crate::framer::{CancelToken, Framer};
use crate::hci::{CommandEngine, LocalVersion};
use crate::speed::SpeedNegotiator;
use crate::transport::{ByteStream, SerialTransport};

const SCO_ROUTE_HCI: [u8; 2] = [0x00, 0x00];

/// A controller that finished bring-up and is ready for supervision.
pub struct Adapter<S: ByteStream> {
    engine: Arc<CommandEngine<S>>,
    version: LocalVersion,
    baud: u32,
    firmware_loaded: bool,
}

impl<S: ByteStream> Adapter<S> {
    pub fn engine(&self) -> &Arc<CommandEngine<S>> {
        &self.engine
    }

    pub fn version(&self) -> LocalVersion {
        self.version
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// False when the controller already ran patched firmware.
    pub fn firmware_loaded(&self) -> bool {
        self.firmware_loaded
    }
}

/// Open the configured UART and bring the controller up on it.
pub fn bring_up(
    cfg: &BringupConfig,
    vendor: &VendorProfile,
    cancel: &CancelToken,
    progress: impl FnMut(Progress),
) -> Result<Adapter<SerialTransport>, BringupError> {
    let transport =
        SerialTransport::open(&cfg.device, cfg.initial_baud).map_err(|source| BringupError::Open {
            path: cfg.device.clone(),
            source,
        })?;
    bring_up_on(transport, cfg, vendor, cancel, progress)
}

/// Bring the controller up over an already open stream.
///
/// The stream is dropped on failure, so no handle outlives an aborted attempt.
pub fn bring_up_on<S: ByteStream>(
    stream: S,
    cfg: &BringupConfig,
    vendor: &VendorProfile,
    cancel: &CancelToken,
    progress: impl FnMut(Progress),
) -> Result<Adapter<S>, BringupError> {
    let result = run_sequence(stream, cfg, vendor, cancel, progress);
    if let Err(e) = &result {
        if e.is_cancelled() {
            info!("bring-up cancelled");
        } else {
            error!("bring-up failed: {}", e);
        }
    }
    result
}

fn run_sequence<S: ByteStream>(
    stream: S,
    cfg: &BringupConfig,
    vendor: &VendorProfile,
    cancel: &CancelToken,
    progress: impl FnMut(Progress),
) -> Result<Adapter<S>, BringupError> {
    let mut framer = Framer::new(stream, cfg.framer_config(), cancel.clone());
    if cfg.skip_handshake {
        framer.mark_active();
    } else {
        framer.establish(cfg.handshake_timeout())?;
    }
    let engine = Arc::new(CommandEngine::new(framer, cfg.command_timeouts()));

    let mut version = reset_and_identify(&engine, cfg, cancel)?;
    info!(
        "controller: manufacturer {:#06X}, HCI rev {:#06X}, LMP subversion {:#06X}",
        version.manufacturer, version.hci_revision, version.lmp_subversion
    );

    let firmware_loaded = if cfg.patched_subversion == Some(version.lmp_subversion) {
        info!("controller already runs patched firmware; skipping download");
        false
    } else {
        let image = FirmwareImage::from_file(&cfg.firmware_path())?;
        let config = ConfigBlob::from_file(&cfg.config_path())?;
        FirmwareLoader::new(&engine, vendor).load(&image, config.as_ref(), progress)?;
        version = reset_and_identify(&engine, cfg, cancel)?;
        info!("patched LMP subversion {:#06X}", version.lmp_subversion);
        true
    };

    let baud = cfg.target_baud;
    if baud != cfg.initial_baud {
        SpeedNegotiator::new(&engine, vendor, cfg.speed_settle())
            .set_speed(baud)
            .map_err(|source| BringupError::Speed { baud, source })?;
    }

    if cfg.route_sco_over_hci {
        match engine.send_command(vendor.sco_routing_opcode, &SCO_ROUTE_HCI) {
            Ok(_) => info!("SCO routed over HCI"),
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => warn!("SCO routing not applied: {}", e),
        }
    }

    info!("adapter ready at {} baud", baud);
    Ok(Adapter {
        engine,
        version,
        baud,
        firmware_loaded,
    })
}

fn reset_and_identify<S: ByteStream>(
    engine: &CommandEngine<S>,
    cfg: &BringupConfig,
    cancel: &CancelToken,
) -> Result<LocalVersion, BringupError> {
    engine.reset()?;
    cancel.sleep(cfg.post_reset_delay())?;
    Ok(engine.read_local_version()?)
}
