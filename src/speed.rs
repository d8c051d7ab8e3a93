//! Controller UART speed change.

use std::time::Duration;

use log::{debug, info, warn};

use crate::config::VendorProfile;
use crate::errors::{CommandError, LinkError};
use crate::hci::CommandEngine;
use crate::transport::{is_supported_baud, ByteStream};

pub struct SpeedNegotiator<'a, S: ByteStream> {
    engine: &'a CommandEngine<S>,
    opcode: u16,
    settle: Duration,
}

impl<'a, S: ByteStream> SpeedNegotiator<'a, S> {
    pub fn new(engine: &'a CommandEngine<S>, profile: &VendorProfile, settle: Duration) -> Self {
        Self {
            engine,
            opcode: profile.baud_opcode,
            settle,
        }
    }

    /// Switch both ends of the line to `baud`.
    ///
    /// The local port is only reconfigured after the controller confirms the
    /// change at the current speed. The link is held for the whole switch so
    /// no other exchange can interleave.
    pub fn set_speed(&self, baud: u32) -> Result<(), CommandError> {
        if !is_supported_baud(baud) {
            return Err(LinkError::UnsupportedBaud(baud).into());
        }

        let mut session = self.engine.session()?;
        let current = session.framer().transport().baud_rate();
        if current == baud {
            debug!("already at {} baud", baud);
            return Ok(());
        }

        let timeout = self.engine.timeouts().control;
        if let Err(e) = session.send_command(self.opcode, &baud.to_le_bytes(), timeout) {
            warn!("controller refused {} baud, staying at {}: {}", baud, current, e);
            return Err(e);
        }

        // The completion must be acknowledged before the line changes under it.
        let framer = session.framer();
        framer.flush_ack()?;
        framer.transport_mut().set_baud_rate(baud)?;
        framer.cancel_token().sleep(self.settle)?;
        framer.transport_mut().discard_buffers()?;

        info!("line speed changed {} -> {} baud", current, baud);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{CancelToken, Framer, FramerConfig};
    use crate::hci::{CommandTimeouts, OP_READ_LOCAL_VERSION, OP_RESET};
    use crate::testing::SimController;

    fn engine(sim: &SimController) -> CommandEngine<SimController> {
        let mut framer = Framer::new(sim.clone(), FramerConfig::default(), CancelToken::new());
        framer.mark_active();
        CommandEngine::new(
            framer,
            CommandTimeouts {
                control: Duration::from_millis(300),
                download: Duration::from_millis(300),
            },
        )
    }

    fn host_baud(engine: &CommandEngine<SimController>) -> u32 {
        engine.session().unwrap().framer().transport().baud_rate()
    }

    #[test]
    fn switches_both_sides() {
        let sim = SimController::new(115200);
        let engine = engine(&sim);
        let profile = VendorProfile::default();

        SpeedNegotiator::new(&engine, &profile, Duration::from_millis(10))
            .set_speed(1_500_000)
            .unwrap();

        assert_eq!(sim.controller_baud(), 1_500_000);
        assert_eq!(host_baud(&engine), 1_500_000);
        assert_eq!(
            sim.commands_with(profile.baud_opcode),
            vec![1_500_000u32.to_le_bytes().to_vec()]
        );
        engine.reset().unwrap();
    }

    #[test]
    fn timeout_leaves_local_speed_unchanged() {
        let sim = SimController::new(115200);
        let profile = VendorProfile::default();
        sim.silence(profile.baud_opcode);
        let engine = engine(&sim);

        let err = SpeedNegotiator::new(&engine, &profile, Duration::from_millis(10))
            .set_speed(921600)
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { .. }));
        assert_eq!(host_baud(&engine), 115200);
        assert_eq!(sim.controller_baud(), 115200);
        engine.send_command(OP_READ_LOCAL_VERSION, &[]).unwrap();
    }

    #[test]
    fn rejected_speed_leaves_local_speed_unchanged() {
        let sim = SimController::new(115200);
        let profile = VendorProfile::default();
        sim.fail_with(profile.baud_opcode, 0x12);
        let engine = engine(&sim);

        let err = SpeedNegotiator::new(&engine, &profile, Duration::ZERO)
            .set_speed(921600)
            .unwrap_err();
        assert!(matches!(err, CommandError::Status { status: 0x12, .. }));
        assert_eq!(host_baud(&engine), 115200);
        engine.send_command(OP_RESET, &[]).unwrap();
    }

    #[test]
    fn unsupported_baud_sends_nothing() {
        let sim = SimController::new(115200);
        let engine = engine(&sim);
        let profile = VendorProfile::default();

        let err = SpeedNegotiator::new(&engine, &profile, Duration::ZERO)
            .set_speed(123_456)
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Link(LinkError::UnsupportedBaud(123_456))
        ));
        assert!(sim.commands().is_empty());
    }
}
