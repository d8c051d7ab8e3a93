//! Three-wire (H5) frame codec.
//!
//! On the wire a frame is `0xC0 <escaped header+payload+checksum> 0xC0`.
//!
//! Header layout:
//! - byte 0, bits 2..0: acknowledgement number
//! - byte 1, bits 2..0: sequence number
//! - byte 1, bits 5..3: frame type code
//! - byte 1, bit 6: reliable flag
//! - bytes 2..3: 12-bit little-endian payload length, upper nibble of byte 3 is
//!   the (unused) extension field
//!
//! The checksum is the XOR of the four header bytes and every payload byte.

use crate::errors::{LinkError, Result};

pub const SLIP_DELIMITER: u8 = 0xC0;
pub const SLIP_ESCAPE: u8 = 0xDB;
/// Escaped forms are the raw byte XOR a per-byte mask.
const ESCAPED_DELIMITER: u8 = SLIP_DELIMITER ^ 0x1C; // 0xDC
const ESCAPED_ESCAPE: u8 = SLIP_ESCAPE ^ 0x06; // 0xDD

pub const HEADER_LEN: usize = 4;
pub const CHECKSUM_LEN: usize = 1;
pub const MAX_PAYLOAD: usize = 4091;

const SEQ_MASK: u8 = 0x07;
const RELIABLE_BIT: u8 = 0x40;

/// Advance a 3-bit sequence/ack counter.
#[inline]
pub fn next_seq(n: u8) -> u8 {
    (n + 1) & SEQ_MASK
}

/// Frame types carried by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Pure acknowledgement, no payload.
    Ack,
    /// HCI command, host to controller.
    Command,
    /// HCI event, controller to host.
    Event,
    /// Link establishment (SYNC / CONFIG).
    LinkControl,
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Ack => 0,
            FrameType::Command => 1,
            FrameType::Event => 4,
            FrameType::LinkControl => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameType::Ack),
            1 => Some(FrameType::Command),
            4 => Some(FrameType::Event),
            7 => Some(FrameType::LinkControl),
            _ => None,
        }
    }

    /// Whether frames of this type are sequenced and must be acknowledged.
    pub fn is_reliable(self) -> bool {
        matches!(self, FrameType::Command | FrameType::Event)
    }
}

/// A decoded link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ack: u8,
    pub seq: u8,
    pub frame_type: FrameType,
    pub reliable: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, seq: u8, ack: u8, payload: Vec<u8>) -> Self {
        Self {
            ack: ack & SEQ_MASK,
            seq: seq & SEQ_MASK,
            frame_type,
            reliable: frame_type.is_reliable(),
            payload,
        }
    }

    /// Zero-payload acknowledgement.
    pub fn ack_only(ack: u8) -> Self {
        Self::new(FrameType::Ack, 0, ack, Vec::new())
    }

    pub fn header(&self) -> [u8; HEADER_LEN] {
        let len = self.payload.len();
        let mut b1 = (self.seq & SEQ_MASK) | (self.frame_type.code() << 3);
        if self.reliable {
            b1 |= RELIABLE_BIT;
        }
        [
            self.ack & SEQ_MASK,
            b1,
            (len & 0xFF) as u8,
            ((len >> 8) & 0x0F) as u8,
        ]
    }

    pub fn checksum(&self) -> u8 {
        checksum(&self.header(), &self.payload)
    }

    /// Encode into delimited, escaped wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(LinkError::PayloadTooLarge {
                len: self.payload.len(),
            });
        }

        let header = self.header();
        let mut out = Vec::with_capacity(self.payload.len() + HEADER_LEN + CHECKSUM_LEN + 4);
        out.push(SLIP_DELIMITER);
        escape_into(&mut out, &header);
        escape_into(&mut out, &self.payload);
        escape_into(&mut out, &[checksum(&header, &self.payload)]);
        out.push(SLIP_DELIMITER);
        Ok(out)
    }

    /// Parse an unescaped frame body (header, payload, checksum).
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(LinkError::Decode(format!(
                "frame body of {} bytes is shorter than header and checksum",
                body.len()
            )));
        }

        let header = [body[0], body[1], body[2], body[3]];
        let len = header[2] as usize | ((header[3] as usize & 0x0F) << 8);
        let payload = &body[HEADER_LEN..body.len() - CHECKSUM_LEN];
        if payload.len() != len {
            return Err(LinkError::Decode(format!(
                "length field says {} bytes, frame carries {}",
                len,
                payload.len()
            )));
        }

        let actual = body[body.len() - 1];
        let expected = checksum(&header, payload);
        if actual != expected {
            return Err(LinkError::Checksum { expected, actual });
        }

        let code = (header[1] >> 3) & 0x07;
        let frame_type = FrameType::from_code(code)
            .ok_or_else(|| LinkError::Decode(format!("unknown frame type code {code}")))?;

        Ok(Self {
            ack: header[0] & SEQ_MASK,
            seq: header[1] & SEQ_MASK,
            frame_type,
            reliable: header[1] & RELIABLE_BIT != 0,
            payload: payload.to_vec(),
        })
    }
}

/// XOR of header bytes and payload bytes.
pub fn checksum(header: &[u8], payload: &[u8]) -> u8 {
    header
        .iter()
        .chain(payload.iter())
        .fold(0u8, |acc, &b| acc ^ b)
}

/// Append `bytes` to `out`, escaping delimiter and escape bytes.
pub fn escape_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        match b {
            SLIP_DELIMITER => out.extend_from_slice(&[SLIP_ESCAPE, ESCAPED_DELIMITER]),
            SLIP_ESCAPE => out.extend_from_slice(&[SLIP_ESCAPE, ESCAPED_ESCAPE]),
            _ => out.push(b),
        }
    }
}

/// Incremental delimiter/escape decoder.
///
/// Bytes outside a frame are discarded. A frame containing an invalid escape
/// sequence, or one that grows past the maximum frame size, is reported as a
/// decode error once its closing delimiter arrives.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    corrupt: Option<String>,
}

const MAX_BODY: usize = HEADER_LEN + MAX_PAYLOAD + CHECKSUM_LEN;

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns the unescaped body when a frame closes.
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>>> {
        if !self.in_frame {
            if byte == SLIP_DELIMITER {
                self.start();
            }
            return None;
        }

        if byte == SLIP_DELIMITER {
            // Back-to-back delimiters: treat the second as the opening one.
            if self.buf.is_empty() && self.corrupt.is_none() && !self.escaped {
                return None;
            }
            self.in_frame = false;
            let body = std::mem::take(&mut self.buf);
            let result = match self.corrupt.take() {
                Some(reason) => Err(LinkError::Decode(reason)),
                None if self.escaped => Err(LinkError::Decode(
                    "frame ended inside an escape sequence".into(),
                )),
                None => Ok(body),
            };
            self.escaped = false;
            return Some(result);
        }

        if self.corrupt.is_some() {
            return None;
        }

        if self.escaped {
            self.escaped = false;
            match byte {
                ESCAPED_DELIMITER => self.buf.push(SLIP_DELIMITER),
                ESCAPED_ESCAPE => self.buf.push(SLIP_ESCAPE),
                other => {
                    self.corrupt = Some(format!("invalid escape sequence 0xDB {other:#04X}"));
                    self.buf.clear();
                }
            }
        } else if byte == SLIP_ESCAPE {
            self.escaped = true;
        } else {
            self.buf.push(byte);
        }

        if self.buf.len() > MAX_BODY {
            self.corrupt = Some(format!("frame exceeds {MAX_BODY} bytes"));
            self.buf.clear();
        }
        None
    }

    fn start(&mut self) {
        self.in_frame = true;
        self.escaped = false;
        self.corrupt = None;
        self.buf.clear();
    }
}

/// Decode every complete frame in `bytes`.
pub fn decode_all(bytes: &[u8]) -> Vec<Result<Frame>> {
    let mut decoder = SlipDecoder::new();
    bytes
        .iter()
        .filter_map(|&b| decoder.push(b))
        .map(|body| body.and_then(|b| Frame::parse(&b)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Wire bytes for a frame whose checksum byte has been replaced.
    fn encode_with_checksum(frame: &Frame, checksum: u8) -> Vec<u8> {
        let mut out = vec![SLIP_DELIMITER];
        escape_into(&mut out, &frame.header());
        escape_into(&mut out, &frame.payload);
        escape_into(&mut out, &[checksum]);
        out.push(SLIP_DELIMITER);
        out
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let frame = Frame::new(FrameType::Command, 5, 3, vec![0u8; 0x1A3]);
        assert_eq!(frame.header(), [0x03, 0x40 | (1 << 3) | 5, 0xA3, 0x01]);

        let ack = Frame::ack_only(6);
        assert_eq!(ack.header(), [0x06, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn delimiter_and_escape_bytes_are_escaped() {
        let frame = Frame::new(FrameType::Event, 0, 0, vec![0xC0, 0xDB, 0x01]);
        let wire = frame.encode().unwrap();
        let inner = &wire[1..wire.len() - 1];
        assert!(!inner.contains(&SLIP_DELIMITER));
        assert!(inner.windows(2).any(|w| w == [0xDB, 0xDC]));
        assert!(inner.windows(2).any(|w| w == [0xDB, 0xDD]));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let frame = Frame::new(FrameType::Command, 0, 0, vec![0; MAX_PAYLOAD + 1]);
        assert!(matches!(
            frame.encode(),
            Err(LinkError::PayloadTooLarge { len }) if len == MAX_PAYLOAD + 1
        ));
    }

    #[test]
    fn invalid_escape_is_a_decode_error() {
        let wire = [SLIP_DELIMITER, 0x00, SLIP_ESCAPE, 0x42, 0x00, SLIP_DELIMITER];
        let frames = decode_all(&wire);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(LinkError::Decode(_))));
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let a = Frame::new(FrameType::Event, 1, 2, vec![0x0E, 0x00]);
        let b = Frame::ack_only(4);
        let mut wire = vec![0x11, 0x22];
        wire.extend(a.encode().unwrap());
        wire.extend([0x33, 0x44]);
        wire.extend(b.encode().unwrap());

        let frames: Vec<Frame> = decode_all(&wire).into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let frame = Frame::new(FrameType::Event, 0, 0, vec![1, 2, 3]);
        let mut header = frame.header();
        header[2] = 2;
        let mut body = header.to_vec();
        body.extend(&frame.payload);
        body.push(checksum(&header, &frame.payload));
        assert!(matches!(Frame::parse(&body), Err(LinkError::Decode(_))));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let header = [0x00, 0x03 << 3, 0x00, 0x00];
        let mut body = header.to_vec();
        body.push(checksum(&header, &[]));
        assert!(matches!(Frame::parse(&body), Err(LinkError::Decode(_))));
    }

    #[test]
    fn sequence_counter_wraps_at_eight() {
        let mut seq = 0;
        for _ in 0..8 {
            seq = next_seq(seq);
        }
        assert_eq!(seq, 0);
        assert_eq!(next_seq(7), 0);
    }

    proptest! {
        #[test]
        fn round_trip_preserves_payload(
            payload in prop::collection::vec(
                prop_oneof![Just(SLIP_DELIMITER), Just(SLIP_ESCAPE), any::<u8>()],
                0..600,
            ),
            seq in 0u8..8,
            ack in 0u8..8,
        ) {
            let frame = Frame::new(FrameType::Event, seq, ack, payload);
            let wire = frame.encode().unwrap();
            let decoded = decode_all(&wire);
            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(decoded[0].as_ref().unwrap(), &frame);
        }

        #[test]
        fn checksum_bit_flip_is_detected(
            payload in prop::collection::vec(any::<u8>(), 0..64),
            bit in 0u8..8,
        ) {
            let frame = Frame::new(FrameType::Event, 2, 1, payload);
            let corrupted = frame.checksum() ^ (1 << bit);
            let wire = encode_with_checksum(&frame, corrupted);
            let decoded = decode_all(&wire);
            prop_assert_eq!(decoded.len(), 1);
            let is_checksum_error = matches!(decoded[0], Err(LinkError::Checksum { .. }));
            prop_assert!(is_checksum_error);
        }
    }
}
