//! In-memory stand-ins for the controller UART.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::errors::Result;
use crate::frame::{next_seq, Frame, FrameType, SlipDecoder};
use crate::transport::ByteStream;

fn timed_out() -> io::Error {
    thread::sleep(Duration::from_millis(2));
    io::Error::new(io::ErrorKind::TimedOut, "no data")
}

/// Replays fixed input bytes and records everything written.
pub struct ScriptedStream {
    input: VecDeque<u8>,
    written: Vec<u8>,
    baud: u32,
}

impl ScriptedStream {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input: input.into(),
            written: Vec::new(),
            baud: 115200,
        }
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(timed_out());
        }
        let n = buf.len().min(self.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.input.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for ScriptedStream {
    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn discard_buffers(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A controller speaking the three-wire protocol.
///
/// Commands are acknowledged and answered with Command Complete events.
/// Bytes only cross the simulated wire when host and controller agree on
/// the line speed.
#[derive(Clone)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    host_baud: u32,
    controller_baud: u32,
    decoder: SlipDecoder,
    /// Outbound bytes, each tagged with the baud rate it was sent at.
    outbound: VecDeque<(u32, u8)>,
    tx_seq: u8,
    expected_host_seq: u8,
    drop_frames: usize,
    silent: HashSet<u16>,
    statuses: HashMap<u16, u8>,
    returns: HashMap<u16, Vec<u8>>,
    links: BTreeMap<u16, (u8, i8)>,
    received: Vec<Frame>,
    commands: Vec<(u16, Vec<u8>)>,
}

impl SimController {
    pub fn new(baud: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                host_baud: baud,
                controller_baud: baud,
                decoder: SlipDecoder::new(),
                outbound: VecDeque::new(),
                tx_seq: 0,
                expected_host_seq: 0,
                drop_frames: 0,
                silent: HashSet::new(),
                statuses: HashMap::new(),
                returns: HashMap::new(),
                links: BTreeMap::new(),
                received: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Acknowledge but never answer `opcode`.
    pub fn silence(&self, opcode: u16) {
        self.lock().silent.insert(opcode);
    }

    /// Answer `opcode` with a non-zero status.
    pub fn fail_with(&self, opcode: u16, status: u8) {
        self.lock().statuses.insert(opcode, status);
    }

    /// Return parameters (after the status byte) for `opcode`.
    pub fn respond_with(&self, opcode: u16, returns: Vec<u8>) {
        self.lock().returns.insert(opcode, returns);
    }

    /// Lose the next `n` reliable frames from the host.
    pub fn drop_next_frames(&self, n: usize) {
        self.lock().drop_frames = n;
    }

    pub fn set_link(&self, handle: u16, link_quality: u8, rssi: i8) {
        self.lock().links.insert(handle, (link_quality, rssi));
    }

    /// Queue an unsolicited event (`code`, `params`).
    pub fn inject_event(&self, code: u8, params: &[u8]) {
        let mut payload = vec![code, params.len() as u8];
        payload.extend_from_slice(params);
        self.lock().queue_reliable(FrameType::Event, payload);
    }

    pub fn controller_baud(&self) -> u32 {
        self.lock().controller_baud
    }

    pub fn received_frames(&self) -> Vec<Frame> {
        self.lock().received.clone()
    }

    /// Every command (opcode, parameters) the controller answered or acknowledged.
    pub fn commands(&self) -> Vec<(u16, Vec<u8>)> {
        self.lock().commands.clone()
    }

    pub fn commands_with(&self, opcode: u16) -> Vec<Vec<u8>> {
        self.commands()
            .into_iter()
            .filter(|(op, _)| *op == opcode)
            .map(|(_, params)| params)
            .collect()
    }
}

impl SimState {
    fn queue(&mut self, frame: Frame) {
        let baud = self.controller_baud;
        if let Ok(wire) = frame.encode() {
            self.outbound.extend(wire.into_iter().map(|b| (baud, b)));
        }
    }

    fn queue_reliable(&mut self, frame_type: FrameType, payload: Vec<u8>) {
        let frame = Frame::new(frame_type, self.tx_seq, self.expected_host_seq, payload);
        self.tx_seq = next_seq(self.tx_seq);
        self.queue(frame);
    }

    fn handle(&mut self, frame: Frame) {
        self.received.push(frame.clone());
        match frame.frame_type {
            FrameType::LinkControl => self.handle_link_control(&frame.payload),
            FrameType::Ack => {}
            FrameType::Command | FrameType::Event => {
                if self.drop_frames > 0 {
                    self.drop_frames -= 1;
                    return;
                }
                if frame.seq != self.expected_host_seq {
                    self.queue(Frame::ack_only(self.expected_host_seq));
                    return;
                }
                self.expected_host_seq = next_seq(frame.seq);
                self.handle_command(&frame.payload);
            }
        }
    }

    fn handle_link_control(&mut self, payload: &[u8]) {
        let response = match payload {
            [0x01, 0x7E, ..] => vec![0x02, 0x7D],
            [0x03, 0xFC, rest @ ..] => {
                let mut r = vec![0x04, 0x7B];
                r.extend(rest.first());
                r
            }
            _ => return,
        };
        self.queue(Frame::new(FrameType::LinkControl, 0, 0, response));
        if payload[0] == 0x01 {
            // Controllers also initiate; the host must answer.
            self.queue(Frame::new(FrameType::LinkControl, 0, 0, vec![0x01, 0x7E]));
        }
    }

    fn handle_command(&mut self, payload: &[u8]) {
        if payload.len() < 4 || payload[0] != 0x01 {
            self.queue(Frame::ack_only(self.expected_host_seq));
            return;
        }
        let opcode = u16::from_le_bytes([payload[1], payload[2]]);
        let params = payload[4..].to_vec();
        self.commands.push((opcode, params.clone()));

        if self.silent.contains(&opcode) {
            self.queue(Frame::ack_only(self.expected_host_seq));
            return;
        }

        let status = self.statuses.get(&opcode).copied().unwrap_or(0);
        let returns = self.returns_for(opcode, &params);
        let mut event_params = vec![0x01, payload[1], payload[2], status];
        event_params.extend(returns);
        let mut event = vec![0x0E, event_params.len() as u8];
        event.extend(event_params);
        self.queue_reliable(FrameType::Event, event);

        if opcode == 0xFC17 && status == 0 && params.len() == 4 {
            self.controller_baud = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
        }
    }

    fn returns_for(&self, opcode: u16, params: &[u8]) -> Vec<u8> {
        if let Some(r) = self.returns.get(&opcode) {
            return r.clone();
        }
        match opcode {
            0x1403 | 0x1405 if params.len() >= 2 => {
                let handle = u16::from_le_bytes([params[0], params[1]]);
                let (lq, rssi) = self.links.get(&handle).copied().unwrap_or((0, -100));
                let value = if opcode == 0x1403 { lq } else { rssi as u8 };
                vec![params[0], params[1], value]
            }
            _ => Vec::new(),
        }
    }
}

impl Read for SimController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let mut n = 0;
        while n < buf.len() {
            match state.outbound.pop_front() {
                Some((baud, byte)) if baud == state.host_baud => {
                    buf[n] = byte;
                    n += 1;
                }
                Some(_) => {}
                None => break,
            }
        }
        drop(state);
        if n == 0 {
            return Err(timed_out());
        }
        Ok(n)
    }
}

impl Write for SimController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.host_baud != state.controller_baud {
            return Ok(buf.len());
        }
        for &b in buf {
            if let Some(Ok(body)) = state.decoder.push(b) {
                if let Ok(frame) = Frame::parse(&body) {
                    state.handle(frame);
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for SimController {
    fn baud_rate(&self) -> u32 {
        self.lock().host_baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.lock().host_baud = baud;
        Ok(())
    }

    fn discard_buffers(&mut self) -> Result<()> {
        self.lock().outbound.clear();
        Ok(())
    }
}
