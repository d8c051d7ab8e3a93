//! HCI command/event exchange on top of the three-wire framer.
//!
//! Exactly one command may be outstanding. The engine can be shared between
//! threads; a caller that finds it busy gets [`CommandError::Busy`] instead of
//! queueing behind the current exchange.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::errors::{CommandError, LinkError};
use crate::frame::FrameType;
use crate::framer::Framer;
use crate::transport::ByteStream;

pub const HCI_COMMAND_PKT: u8 = 0x01;

pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_SYNC_CONN_COMPLETE: u8 = 0x2C;

pub const OP_RESET: u16 = 0x0C03;
pub const OP_READ_LOCAL_VERSION: u16 = 0x1001;
pub const OP_READ_LINK_QUALITY: u16 = 0x1403;
pub const OP_READ_RSSI: u16 = 0x1405;

/// Unsolicited events kept for later consumers; older ones are dropped first.
const UNSOLICITED_LIMIT: usize = 64;

/// Deadlines per command class.
#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    pub control: Duration,
    pub download: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(1),
            download: Duration::from_secs(3),
        }
    }
}

/// An HCI event as carried in an Event frame: code, then parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPayload {
    pub code: u8,
    pub params: Vec<u8>,
}

impl EventPayload {
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let [code, len, rest @ ..] = payload else {
            return Err(CommandError::MalformedEvent(format!(
                "{} byte event",
                payload.len()
            )));
        };
        let len = *len as usize;
        if rest.len() < len {
            return Err(CommandError::MalformedEvent(format!(
                "event {:#04X} declares {} parameter bytes, carries {}",
                code,
                len,
                rest.len()
            )));
        }
        Ok(Self {
            code: *code,
            params: rest[..len].to_vec(),
        })
    }

    /// Opcode this event completes or reports status for, if any.
    pub fn opcode(&self) -> Option<u16> {
        match (self.code, self.params.as_slice()) {
            (EVT_CMD_COMPLETE, [_, lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            (EVT_CMD_STATUS, [_, _, lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u8> {
        match (self.code, self.params.as_slice()) {
            (EVT_CMD_COMPLETE, [_, _, _, status, ..]) => Some(*status),
            (EVT_CMD_STATUS, [status, ..]) => Some(*status),
            _ => None,
        }
    }

    /// Command Complete return parameters following the status byte.
    pub fn return_params(&self) -> &[u8] {
        match self.code {
            EVT_CMD_COMPLETE if self.params.len() > 4 => &self.params[4..],
            _ => &[],
        }
    }
}

/// The command currently awaiting its completion event.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub opcode: u16,
    pub parameters: Vec<u8>,
    pub expected_event_code: u8,
    pub deadline: Instant,
}

impl PendingCommand {
    pub fn new(opcode: u16, parameters: &[u8], timeout: Duration) -> Result<Self, CommandError> {
        if parameters.len() > u8::MAX as usize {
            return Err(CommandError::ParamsTooLong {
                len: parameters.len(),
            });
        }
        Ok(Self {
            opcode,
            parameters: parameters.to_vec(),
            expected_event_code: EVT_CMD_COMPLETE,
            deadline: Instant::now() + timeout,
        })
    }

    /// Command packet: type tag, opcode (LE), parameter length, parameters.
    pub fn packet(&self) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(4 + self.parameters.len());
        pkt.push(HCI_COMMAND_PKT);
        pkt.extend_from_slice(&self.opcode.to_le_bytes());
        pkt.push(self.parameters.len() as u8);
        pkt.extend_from_slice(&self.parameters);
        pkt
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Controller identification from Read Local Version Information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

impl LocalVersion {
    pub fn parse(returns: &[u8]) -> Result<Self, CommandError> {
        match returns {
            [hci_version, rev_lo, rev_hi, lmp_version, man_lo, man_hi, sub_lo, sub_hi, ..] => {
                Ok(Self {
                    hci_version: *hci_version,
                    hci_revision: u16::from_le_bytes([*rev_lo, *rev_hi]),
                    lmp_version: *lmp_version,
                    manufacturer: u16::from_le_bytes([*man_lo, *man_hi]),
                    lmp_subversion: u16::from_le_bytes([*sub_lo, *sub_hi]),
                })
            }
            _ => Err(CommandError::MalformedEvent(format!(
                "local version needs 8 return bytes, got {}",
                returns.len()
            ))),
        }
    }
}

pub struct CommandEngine<S: ByteStream> {
    framer: Mutex<Framer<S>>,
    unsolicited: Mutex<VecDeque<EventPayload>>,
    timeouts: CommandTimeouts,
}

impl<S: ByteStream> CommandEngine<S> {
    pub fn new(framer: Framer<S>, timeouts: CommandTimeouts) -> Self {
        Self {
            framer: Mutex::new(framer),
            unsolicited: Mutex::new(VecDeque::new()),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    /// Exclusive access for a sequence of exchanges.
    pub fn session(&self) -> Result<CommandSession<'_, S>, CommandError> {
        let framer = match self.framer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(CommandError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("command engine lock poisoned; continuing with current link state");
                poisoned.into_inner()
            }
        };
        Ok(CommandSession {
            framer,
            unsolicited: &self.unsolicited,
        })
    }

    /// Send a control command and wait for its completion.
    pub fn send_command(&self, opcode: u16, params: &[u8]) -> Result<EventPayload, CommandError> {
        self.send_command_with_timeout(opcode, params, self.timeouts.control)
    }

    pub fn send_command_with_timeout(
        &self,
        opcode: u16,
        params: &[u8],
        timeout: Duration,
    ) -> Result<EventPayload, CommandError> {
        self.session()?.send_command(opcode, params, timeout)
    }

    pub fn reset(&self) -> Result<(), CommandError> {
        self.send_command(OP_RESET, &[]).map(|_| ())
    }

    pub fn read_local_version(&self) -> Result<LocalVersion, CommandError> {
        self.read_local_version_with_timeout(self.timeouts.control)
    }

    pub fn read_local_version_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<LocalVersion, CommandError> {
        let event = self.send_command_with_timeout(OP_READ_LOCAL_VERSION, &[], timeout)?;
        LocalVersion::parse(event.return_params())
    }

    /// Collect unsolicited events for up to `window` while no command is outstanding.
    pub fn poll_events(&self, window: Duration) -> Result<usize, CommandError> {
        self.session()?.poll_events(window)
    }

    /// Take every queued unsolicited event.
    pub fn drain_unsolicited(&self) -> Vec<EventPayload> {
        lock_queue(&self.unsolicited).drain(..).collect()
    }
}

fn lock_queue(queue: &Mutex<VecDeque<EventPayload>>) -> MutexGuard<'_, VecDeque<EventPayload>> {
    queue.lock().unwrap_or_else(|p| p.into_inner())
}

/// Exclusive hold on the link for one or more exchanges.
pub struct CommandSession<'a, S: ByteStream> {
    framer: MutexGuard<'a, Framer<S>>,
    unsolicited: &'a Mutex<VecDeque<EventPayload>>,
}

impl<S: ByteStream> CommandSession<'_, S> {
    pub fn framer(&mut self) -> &mut Framer<S> {
        &mut self.framer
    }

    pub fn send_command(
        &mut self,
        opcode: u16,
        params: &[u8],
        timeout: Duration,
    ) -> Result<EventPayload, CommandError> {
        let pending = PendingCommand::new(opcode, params, timeout)?;
        debug!(
            "command {:#06X} ({} param bytes, deadline {:?})",
            opcode,
            params.len(),
            timeout
        );
        match self
            .framer
            .send_until(FrameType::Command, &pending.packet(), pending.deadline)
        {
            Ok(()) => {}
            Err(LinkError::AckTimeout { .. } | LinkError::Timeout) => {
                return Err(CommandError::Timeout { opcode });
            }
            Err(e) => return Err(e.into()),
        }

        loop {
            let remaining = pending.remaining();
            if remaining.is_zero() {
                return Err(CommandError::Timeout { opcode });
            }

            let frame = match self.framer.receive(remaining) {
                Ok(frame) => frame,
                Err(LinkError::Timeout) => return Err(CommandError::Timeout { opcode }),
                Err(LinkError::Checksum { .. } | LinkError::Decode(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            if frame.frame_type != FrameType::Event {
                debug!("ignoring {:?} frame while awaiting {:#06X}", frame.frame_type, opcode);
                continue;
            }

            let event = match EventPayload::parse(&frame.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!("dropping event: {}", e);
                    continue;
                }
            };

            if event.opcode() == Some(pending.opcode) {
                match event.status() {
                    Some(0) if event.code == pending.expected_event_code => {
                        trace!("command {:#06X} complete: {:02X?}", opcode, event.params);
                        return Ok(event);
                    }
                    Some(0) => continue,
                    Some(status) => return Err(CommandError::Status { opcode, status }),
                    None => {
                        return Err(CommandError::MalformedEvent(format!(
                            "completion for {opcode:#06X} carries no status"
                        )))
                    }
                }
            }

            self.stash(event);
        }
    }

    pub fn poll_events(&mut self, window: Duration) -> Result<usize, CommandError> {
        let deadline = Instant::now() + window;
        let mut count = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.framer.receive(remaining) {
                Ok(frame) if frame.frame_type == FrameType::Event => {
                    match EventPayload::parse(&frame.payload) {
                        Ok(event) => {
                            self.stash(event);
                            count += 1;
                        }
                        Err(e) => warn!("dropping event: {}", e),
                    }
                }
                Ok(_) => {}
                Err(LinkError::Timeout) => break,
                Err(LinkError::Checksum { .. } | LinkError::Decode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.framer.flush_ack()?;
        Ok(count)
    }

    fn stash(&self, event: EventPayload) {
        if event.opcode().is_some() {
            debug!(
                "dropping stale completion for {:#06X}",
                event.opcode().unwrap_or_default()
            );
            return;
        }
        let mut queue = lock_queue(self.unsolicited);
        if queue.len() >= UNSOLICITED_LIMIT {
            queue.pop_front();
        }
        queue.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::framer::{CancelToken, FramerConfig};
    use crate::testing::{ScriptedStream, SimController};
    use std::sync::Arc;
    use std::thread;

    fn engine<S: ByteStream>(stream: S) -> CommandEngine<S> {
        let mut framer = Framer::new(stream, FramerConfig::default(), CancelToken::new());
        framer.mark_active();
        CommandEngine::new(framer, CommandTimeouts::default())
    }

    fn reset_complete(seq: u8, status: u8) -> Frame {
        Frame::new(
            FrameType::Event,
            seq,
            1,
            vec![EVT_CMD_COMPLETE, 0x04, 0x01, 0x03, 0x0C, status],
        )
    }

    #[test]
    fn command_packet_layout() {
        let pending = PendingCommand::new(0xFC17, &[0x60, 0xE3, 0x16, 0x00], Duration::ZERO).unwrap();
        assert_eq!(
            pending.packet(),
            vec![0x01, 0x17, 0xFC, 0x04, 0x60, 0xE3, 0x16, 0x00]
        );
    }

    #[test]
    fn returns_first_matching_event() {
        let mut wire = Vec::new();
        for seq in 0..3u8 {
            wire.extend(reset_complete(seq, 0).encode().unwrap());
        }
        let engine = engine(ScriptedStream::new(wire));

        let started = Instant::now();
        let event = engine
            .send_command_with_timeout(OP_RESET, &[], Duration::from_secs(1))
            .unwrap();
        assert_eq!(event.code, EVT_CMD_COMPLETE);
        assert_eq!(event.params, vec![0x01, 0x03, 0x0C, 0x00]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn non_matching_events_time_out_at_deadline() {
        let other = Frame::new(
            FrameType::Event,
            0,
            1,
            vec![EVT_CMD_COMPLETE, 0x04, 0x01, 0x01, 0x10, 0x00],
        );
        let engine = engine(ScriptedStream::new(other.encode().unwrap()));

        let started = Instant::now();
        let err = engine
            .send_command_with_timeout(OP_RESET, &[], Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { opcode: OP_RESET }));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn missing_event_times_out() {
        let sim = SimController::new(115200);
        sim.silence(OP_RESET);
        let engine = engine(sim);
        let err = engine
            .send_command_with_timeout(OP_RESET, &[], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[test]
    fn silent_controller_times_out_at_command_deadline() {
        let engine = engine(ScriptedStream::new(Vec::new()));
        let started = Instant::now();
        let err = engine
            .send_command_with_timeout(OP_RESET, &[], Duration::from_millis(200))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, CommandError::Timeout { opcode: OP_RESET }));
    }

    #[test]
    fn non_success_status_is_an_error() {
        let sim = SimController::new(115200);
        sim.fail_with(OP_RESET, 0x0C);
        let engine = engine(sim);
        assert!(matches!(
            engine.reset(),
            Err(CommandError::Status {
                opcode: OP_RESET,
                status: 0x0C
            })
        ));
    }

    #[test]
    fn oversized_parameters_are_refused() {
        let engine = engine(SimController::new(115200));
        assert!(matches!(
            engine.send_command(0xFC20, &[0u8; 256]),
            Err(CommandError::ParamsTooLong { len: 256 })
        ));
    }

    #[test]
    fn concurrent_command_fails_fast_with_busy() {
        let sim = SimController::new(115200);
        sim.silence(OP_RESET);
        let engine = Arc::new(engine(sim));

        let holder = Arc::clone(&engine);
        let worker = thread::spawn(move || {
            holder.send_command_with_timeout(OP_RESET, &[], Duration::from_millis(500))
        });
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        assert!(matches!(
            engine.send_command(OP_READ_LOCAL_VERSION, &[]),
            Err(CommandError::Busy)
        ));
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(worker.join().unwrap().is_err());
    }

    #[test]
    fn parses_local_version() {
        let sim = SimController::new(115200);
        sim.respond_with(
            OP_READ_LOCAL_VERSION,
            vec![0x08, 0x0D, 0x00, 0x08, 0x5D, 0x00, 0x23, 0x87],
        );
        let version = engine(sim).read_local_version().unwrap();
        assert_eq!(version.manufacturer, 0x005D);
        assert_eq!(version.lmp_subversion, 0x8723);
        assert_eq!(version.hci_revision, 0x000D);
    }

    #[test]
    fn unsolicited_events_are_queued() {
        let sim = SimController::new(115200);
        let engine = engine(sim.clone());
        sim.inject_event(EVT_DISCONN_COMPLETE, &[0x00, 0x40, 0x00, 0x13]);
        engine.reset().unwrap();

        let queued = engine.drain_unsolicited();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].code, EVT_DISCONN_COMPLETE);
        assert!(engine.drain_unsolicited().is_empty());
    }

    #[test]
    fn truncated_event_is_malformed() {
        assert!(matches!(
            EventPayload::parse(&[EVT_CMD_COMPLETE, 0x04, 0x01]),
            Err(CommandError::MalformedEvent(_))
        ));
    }
}
