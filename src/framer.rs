//! Three-wire link session over a [`ByteStream`].
//!
//! Reliable frames (commands and events) are sequenced with a window of one:
//! `send` does not return until the peer acknowledges the frame, retransmitting
//! a bounded number of times. Incoming reliable frames are acknowledged either
//! by piggybacking on the next outbound frame or, if nothing is sent within
//! `ack_delay`, by a dedicated ack frame.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::{LinkError, Result};
use crate::frame::{next_seq, Frame, FrameType, SlipDecoder};
use crate::transport::{ByteStream, READ_POLL};

const SYNC: [u8; 2] = [0x01, 0x7E];
const SYNC_RESPONSE: [u8; 2] = [0x02, 0x7D];
const CONFIG: [u8; 2] = [0x03, 0xFC];
const CONFIG_RESPONSE: [u8; 2] = [0x04, 0x7B];
/// Sliding window 1, no OOF flow control, no data-integrity CRC.
const CONFIG_FIELD: u8 = 0x01;

/// Interval between SYNC/CONFIG retries during link establishment.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(250);

/// Shared flag used to abort any blocking wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(READ_POLL));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Initialized,
    Active,
}

/// Sequencing state of one bring-up session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSession {
    /// Sequence number of the next reliable frame we send.
    pub local_seq: u8,
    /// Acknowledgement number last advertised to the peer.
    pub local_ack: u8,
    /// Sequence number expected on the next reliable frame from the peer.
    pub peer_seq_expected: u8,
    /// Acknowledgement number last received from the peer.
    pub peer_ack: u8,
    pub state: LinkState,
}

impl Default for LinkSession {
    fn default() -> Self {
        Self {
            local_seq: 0,
            local_ack: 0,
            peer_seq_expected: 0,
            peer_ack: 0,
            state: LinkState::Uninitialized,
        }
    }
}

impl LinkSession {
    pub fn ack_pending(&self) -> bool {
        self.local_ack != self.peer_seq_expected
    }
}

#[derive(Debug, Clone)]
pub struct FramerConfig {
    /// How long to wait for the peer to acknowledge a reliable frame.
    pub ack_timeout: Duration,
    /// Retransmissions of an unacknowledged frame before giving up.
    pub max_retransmits: u32,
    /// How long an ack may wait for a piggyback opportunity.
    pub ack_delay: Duration,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(250),
            max_retransmits: 3,
            ack_delay: Duration::from_millis(20),
        }
    }
}

/// Counters of frames dropped by the framer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub checksum_errors: usize,
    pub decode_errors: usize,
    pub duplicates: usize,
    pub retransmits: usize,
}

pub struct Framer<S: ByteStream> {
    stream: S,
    session: LinkSession,
    decoder: SlipDecoder,
    rx: VecDeque<u8>,
    /// Data frames that arrived while waiting for an acknowledgement.
    inbox: VecDeque<Frame>,
    ack_pending_since: Option<Instant>,
    config: FramerConfig,
    cancel: CancelToken,
    stats: FramerStats,
}

impl<S: ByteStream> Framer<S> {
    pub fn new(stream: S, config: FramerConfig, cancel: CancelToken) -> Self {
        Self {
            stream,
            session: LinkSession::default(),
            decoder: SlipDecoder::new(),
            rx: VecDeque::new(),
            inbox: VecDeque::new(),
            ack_pending_since: None,
            config,
            cancel,
            stats: FramerStats::default(),
        }
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    pub fn state(&self) -> LinkState {
        self.session.state
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transport(&self) -> &S {
        &self.stream
    }

    pub fn transport_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Treat the link as established without the SYNC/CONFIG exchange.
    pub fn mark_active(&mut self) {
        self.session.state = LinkState::Active;
    }

    /// Run SYNC then CONFIG until both are answered or `timeout` elapses.
    pub fn establish(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while self.session.state == LinkState::Uninitialized {
            self.send_link_control(&SYNC)?;
            self.await_link_state(LinkState::Initialized, deadline)?;
        }
        debug!("link synchronised");

        while self.session.state == LinkState::Initialized {
            self.send_link_control(&[CONFIG[0], CONFIG[1], CONFIG_FIELD])?;
            self.await_link_state(LinkState::Active, deadline)?;
        }
        info!("three-wire link active");
        Ok(())
    }

    fn await_link_state(&mut self, target: LinkState, deadline: Instant) -> Result<()> {
        let retry_at = (Instant::now() + HANDSHAKE_RETRY).min(deadline);
        while self.session.state != target {
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }
            match self.read_frame(retry_at) {
                Ok(frame) => {
                    if let Some(data) = self.accept(frame)? {
                        debug!("ignoring {:?} frame during link setup", data.frame_type);
                    }
                }
                Err(LinkError::Timeout) => return Ok(()),
                Err(e @ (LinkError::Checksum { .. } | LinkError::Decode(_))) => {
                    debug!("discarding frame during link setup: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Send one frame. Reliable frames block until acknowledged.
    pub fn send(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<()> {
        self.send_reliable(frame_type, payload, None)
    }

    /// Like [`Framer::send`], but gives up retransmitting once `deadline`
    /// passes. The last ack wait is shortened to end at `deadline`.
    pub fn send_until(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<()> {
        self.send_reliable(frame_type, payload, Some(deadline))
    }

    fn send_reliable(
        &mut self,
        frame_type: FrameType,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        if frame_type.is_reliable() && self.session.state != LinkState::Active {
            return Err(LinkError::NotActive);
        }

        let seq = if frame_type.is_reliable() {
            self.session.local_seq
        } else {
            0
        };
        let frame = Frame::new(frame_type, seq, self.session.peer_seq_expected, payload.to_vec());
        let wire = frame.encode()?;
        self.write_wire(&wire, frame.ack)?;

        if !frame_type.is_reliable() {
            return Ok(());
        }

        for attempt in 0..=self.config.max_retransmits {
            if attempt > 0 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                self.stats.retransmits += 1;
                warn!(
                    "retransmitting frame seq={} (attempt {}/{})",
                    seq, attempt, self.config.max_retransmits
                );
                // Refresh the piggybacked ack in case more data arrived meanwhile.
                let frame = Frame::new(
                    frame_type,
                    seq,
                    self.session.peer_seq_expected,
                    payload.to_vec(),
                );
                self.write_wire(&frame.encode()?, frame.ack)?;
            }
            if self.wait_for_ack(seq, deadline)? {
                self.session.local_seq = next_seq(seq);
                return Ok(());
            }
        }

        Err(LinkError::AckTimeout { seq })
    }

    /// Wait one ack period, cut short by `limit`; returns whether `seq` was
    /// acknowledged.
    fn wait_for_ack(&mut self, seq: u8, limit: Option<Instant>) -> Result<bool> {
        let period = Instant::now() + self.config.ack_timeout;
        let deadline = limit.map_or(period, |limit| limit.min(period));
        let wanted = next_seq(seq);
        loop {
            if self.session.peer_ack == wanted {
                return Ok(true);
            }
            match self.read_frame(deadline) {
                Ok(frame) => {
                    if let Some(data) = self.accept(frame)? {
                        self.inbox.push_back(data);
                    }
                }
                Err(LinkError::Timeout) => return Ok(false),
                Err(LinkError::Checksum { .. } | LinkError::Decode(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive the next data frame (command or event) within `timeout`.
    ///
    /// Checksum and decode failures are returned to the caller; the bad frame
    /// is already discarded.
    pub fn receive(&mut self, timeout: Duration) -> Result<Frame> {
        if let Some(frame) = self.inbox.pop_front() {
            return Ok(frame);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let frame = self.read_frame(deadline)?;
            if let Some(data) = self.accept(frame)? {
                return Ok(data);
            }
        }
    }

    /// Send a dedicated ack if the peer is owed one.
    pub fn flush_ack(&mut self) -> Result<()> {
        if !self.session.ack_pending() {
            return Ok(());
        }
        let frame = Frame::ack_only(self.session.peer_seq_expected);
        self.write_wire(&frame.encode()?, frame.ack)
    }

    fn flush_due_ack(&mut self) -> Result<()> {
        match self.ack_pending_since {
            Some(since) if since.elapsed() >= self.config.ack_delay => self.flush_ack(),
            _ => Ok(()),
        }
    }

    fn send_link_control(&mut self, message: &[u8]) -> Result<()> {
        self.send(FrameType::LinkControl, message)
    }

    fn write_wire(&mut self, wire: &[u8], ack: u8) -> Result<()> {
        self.stream.write_all(wire)?;
        self.stream.flush()?;
        self.session.local_ack = ack;
        if !self.session.ack_pending() {
            self.ack_pending_since = None;
        }
        Ok(())
    }

    /// Apply sequencing to a decoded frame; returns it if it carries data for the caller.
    fn accept(&mut self, frame: Frame) -> Result<Option<Frame>> {
        if frame.frame_type == FrameType::LinkControl {
            self.handle_link_control(&frame.payload)?;
            return Ok(None);
        }

        self.session.peer_ack = frame.ack;

        if frame.frame_type == FrameType::Ack {
            return Ok(None);
        }

        if frame.reliable {
            if frame.seq != self.session.peer_seq_expected {
                self.stats.duplicates += 1;
                debug!(
                    "dropping out-of-order frame seq={} (expected {})",
                    frame.seq, self.session.peer_seq_expected
                );
                let ack = Frame::ack_only(self.session.peer_seq_expected);
                self.write_wire(&ack.encode()?, ack.ack)?;
                return Ok(None);
            }
            self.session.peer_seq_expected = next_seq(frame.seq);
            if self.ack_pending_since.is_none() {
                self.ack_pending_since = Some(Instant::now());
            }
        }

        Ok(Some(frame))
    }

    fn handle_link_control(&mut self, payload: &[u8]) -> Result<()> {
        match payload {
            [0x01, 0x7E, ..] => {
                self.send_link_control(&SYNC_RESPONSE)?;
            }
            [0x02, 0x7D, ..] => {
                if self.session.state == LinkState::Uninitialized {
                    self.session.state = LinkState::Initialized;
                }
            }
            [0x03, 0xFC, rest @ ..] => {
                let mut response = CONFIG_RESPONSE.to_vec();
                response.push(rest.first().copied().unwrap_or(CONFIG_FIELD));
                self.send_link_control(&response)?;
            }
            [0x04, 0x7B, ..] => {
                if self.session.state == LinkState::Initialized {
                    self.session.state = LinkState::Active;
                }
            }
            other => debug!("ignoring link control message {:02X?}", other),
        }
        Ok(())
    }

    /// Read bytes until a complete frame decodes or `deadline` passes.
    fn read_frame(&mut self, deadline: Instant) -> Result<Frame> {
        let mut buf = [0u8; 256];
        loop {
            if self.cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }

            while let Some(byte) = self.rx.pop_front() {
                if let Some(body) = self.decoder.push(byte) {
                    let parsed = body.and_then(|b| Frame::parse(&b));
                    match &parsed {
                        Err(LinkError::Checksum { expected, actual }) => {
                            self.stats.checksum_errors += 1;
                            warn!(
                                "discarding frame: checksum {:#04X} != {:#04X}",
                                actual, expected
                            );
                        }
                        Err(LinkError::Decode(reason)) => {
                            self.stats.decode_errors += 1;
                            warn!("discarding frame: {}", reason);
                        }
                        _ => {}
                    }
                    return parsed;
                }
            }

            if Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }

            self.flush_due_ack()?;

            match self.stream.read(&mut buf) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => self.rx.extend(&buf[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
