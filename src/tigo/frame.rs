use crate::prelude::*;

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::{Decoder, Encoder};

pub const START: [u8; 2] = [0x7e, 0x07];
pub const END: [u8; 2] = [0x7e, 0x08];
const ESCAPE: u8 = 0x7e;

// (escape code, literal byte)
const ESCAPES: [(u8, u8); 7] = [
    (0x00, 0x7e),
    (0x01, 0x24),
    (0x02, 0x23),
    (0x03, 0x25),
    (0x04, 0xa4),
    (0x05, 0xa3),
    (0x06, 0xa5),
];

/// Upper bound on an escaped frame, markers included. A start marker with no
/// end marker inside this many bytes is treated as corrupt.
pub const MAX_FRAME_SIZE: usize = 2048;

// address(2) + type(2) + checksum(2)
const MIN_BODY_SIZE: usize = 6;

const FROM_GATEWAY: u16 = 0x8000;

// {{{ FrameType
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum FrameType {
    EnumerationEndResponse = 0x0006,
    VersionRequest = 0x000a,
    VersionResponse = 0x000b,
    EnumerationStartRequest = 0x0014,
    EnumerationStartResponse = 0x0015,
    EnumerationRequest = 0x0038,
    EnumerationResponse = 0x0039,
    IdentifyRequest = 0x003a,
    IdentifyResponse = 0x003b,
    AssignGatewayIdRequest = 0x003c,
    AssignGatewayIdResponse = 0x003d,
    ReceiveRequest = 0x0148,
    ReceiveResponse = 0x0149,
    PingRequest = 0x0b00,
    PingResponse = 0x0b01,
    CommandRequest = 0x0b0f,
    CommandResponse = 0x0b10,
    EnumerationEndRequest = 0x0e02,
}
// }}}

// {{{ Checksum
/// Reflected CRC-16 (poly 0x8408) seeded with 0x8408, as used by the gateway link.
pub enum Tigo {}

impl crc16::CrcType for Tigo {
    fn init() -> u16 {
        0x8408
    }

    fn update(mut crc: u16, msg: &[u8]) -> u16 {
        for byte in msg {
            crc ^= *byte as u16;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0x8408
                } else {
                    crc >> 1
                };
            }
        }
        crc
    }

    fn get(crc: u16) -> u16 {
        crc
    }
}

pub fn checksum(data: &[u8]) -> u16 {
    crc16::State::<Tigo>::calculate(data)
}
// }}}

// {{{ Corruption
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Corruption {
    Runt(usize),
    Oversize,
    DanglingEscape,
    BadEscape(u8),
    Checksum { expected: u16, actual: u16 },
}

impl std::fmt::Display for Corruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runt(len) => write!(f, "frame body too short ({} bytes)", len),
            Self::Oversize => write!(f, "no end marker within {} bytes", MAX_FRAME_SIZE),
            Self::DanglingEscape => write!(f, "escape byte at end of frame"),
            Self::BadEscape(code) => write!(f, "invalid escape sequence 7e {:02x}", code),
            Self::Checksum { expected, actual } => {
                write!(f, "checksum mismatch - got {:04x}, expected {:04x}", actual, expected)
            }
        }
    }
} // }}}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub address: u16,
    pub frame_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn from_gateway(gateway_id: u16, frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            address: FROM_GATEWAY | (gateway_id & !FROM_GATEWAY),
            frame_type: frame_type.into(),
            payload,
        }
    }

    pub fn is_from_gateway(&self) -> bool {
        self.address & FROM_GATEWAY != 0
    }

    pub fn gateway_id(&self) -> u16 {
        self.address & !FROM_GATEWAY
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.frame_type).ok()
    }

    // unescaped body, checksum excluded
    fn bytes(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(4 + self.payload.len());
        r.extend_from_slice(&self.address.to_be_bytes());
        r.extend_from_slice(&self.frame_type.to_be_bytes());
        r.extend_from_slice(&self.payload);
        r
    }

    fn decode(body: &[u8]) -> Result<Self, Corruption> {
        if body.len() < MIN_BODY_SIZE {
            return Err(Corruption::Runt(body.len()));
        }

        let (data, trailer) = body.split_at(body.len() - 2);
        let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
        let expected = checksum(data);
        if actual != expected {
            return Err(Corruption::Checksum { expected, actual });
        }

        Ok(Self {
            address: u16::from_be_bytes([data[0], data[1]]),
            frame_type: u16::from_be_bytes([data[2], data[3]]),
            payload: data[4..].to_vec(),
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let direction = if self.is_from_gateway() { "from" } else { "to" };
        write!(
            f,
            "Frame({} gateway {:04x}, type={:04x}, payload={} bytes)",
            direction,
            self.gateway_id(),
            self.frame_type,
            self.payload.len()
        )
    }
}

fn unescape(data: &[u8]) -> Result<Vec<u8>, Corruption> {
    let mut r = Vec::with_capacity(data.len());
    let mut iter = data.iter().copied();

    while let Some(byte) = iter.next() {
        if byte != ESCAPE {
            r.push(byte);
            continue;
        }

        let code = iter.next().ok_or(Corruption::DanglingEscape)?;
        let literal = ESCAPES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, literal)| *literal)
            .ok_or(Corruption::BadEscape(code))?;
        r.push(literal);
    }

    Ok(r)
}

fn escape_code(byte: u8) -> Option<u8> {
    ESCAPES
        .iter()
        .find(|(_, literal)| *literal == byte)
        .map(|(code, _)| *code)
}

fn find(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub frames: u64,
    pub corrupt: u64,
    pub noise_bytes: u64,
}

/// Recovers checksummed frames from an unaligned byte stream.
///
/// Bytes ahead of a start marker are discarded as noise. A candidate that
/// fails validation loses only its leading marker byte, so a marker hiding
/// inside corrupt data is still found on the next scan.
#[derive(Debug, Default)]
pub struct FrameCodec {
    stats: FrameStats,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters accumulated since the last call and resets them.
    pub fn take_stats(&mut self) -> FrameStats {
        std::mem::take(&mut self.stats)
    }

    fn skip_noise(&mut self, buf: &mut BytesMut) {
        let skip = match find(buf, &START) {
            Some(pos) => pos,
            // a trailing 7e may be the first half of a start marker
            None if buf.last() == Some(&ESCAPE) => buf.len() - 1,
            None => buf.len(),
        };

        if skip > 0 {
            trace!("discarding {} bytes of noise", skip);
            self.stats.noise_bytes += skip as u64;
            buf.advance(skip);
        }
    }

    fn drop_candidate(&mut self, buf: &mut BytesMut, reason: Corruption) {
        match reason {
            Corruption::Checksum { .. } => warn!("dropping frame: {}", reason),
            _ => debug!("dropping frame: {}", reason),
        }
        self.stats.corrupt += 1;
        buf.advance(1);
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            self.skip_noise(buf);
            if buf.len() < START.len() {
                return Ok(None);
            }

            let end = match find(&buf[START.len()..], &END) {
                Some(pos) => START.len() + pos,
                None if buf.len() >= MAX_FRAME_SIZE => {
                    self.drop_candidate(buf, Corruption::Oversize);
                    continue;
                }
                None => return Ok(None), // wait for the rest of the frame
            };

            if end + END.len() > MAX_FRAME_SIZE {
                self.drop_candidate(buf, Corruption::Oversize);
                continue;
            }

            match unescape(&buf[START.len()..end]).and_then(|body| Frame::decode(&body)) {
                Ok(frame) => {
                    buf.advance(end + END.len());
                    self.stats.frames += 1;
                    trace!("RX {}", frame);
                    return Ok(Some(frame));
                }
                Err(reason) => self.drop_candidate(buf, reason),
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if !buf.is_empty() {
            debug!("discarding {} bytes of partial frame at end of stream", buf.len());
            buf.clear();
        }

        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut body = frame.bytes();
        body.extend_from_slice(&checksum(&body).to_le_bytes());

        let mut escaped = Vec::with_capacity(body.len() * 2 + START.len() + END.len());
        escaped.extend_from_slice(&START);
        for byte in body {
            match escape_code(byte) {
                Some(code) => escaped.extend_from_slice(&[ESCAPE, code]),
                None => escaped.push(byte),
            }
        }
        escaped.extend_from_slice(&END);

        if escaped.len() > MAX_FRAME_SIZE {
            bail!("encoded frame is {} bytes, limit is {}", escaped.len(), MAX_FRAME_SIZE);
        }

        dst.put_slice(&escaped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn checksum_matches_gateway_crc() {
        assert_eq!(checksum(b"123456789"), 0x837f);
        assert_eq!(checksum(&[0x80, 0x12, 0x01, 0x49]), 0x510b);
    }

    #[test]
    fn escapes_reserved_bytes() {
        let frame = Frame::from_gateway(0x12, FrameType::ReceiveResponse, vec![0x7e, 0x24, 0x23, 0x25, 0xa4, 0xa3, 0xa5]);
        let buf = encode(frame.clone());

        // only the markers may contain a bare 7e followed by 07/08
        assert_eq!(find(&buf[2..buf.len() - 2], &START), None);
        assert_eq!(find(&buf[2..buf.len() - 2], &END), None);
        assert!(!buf[2..buf.len() - 2].contains(&0x24));

        let mut buf = buf;
        assert_eq!(FrameCodec::new().decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn unescape_rejects_unknown_code() {
        assert_eq!(unescape(&[0x01, 0x7e, 0x09]), Err(Corruption::BadEscape(0x09)));
        assert_eq!(unescape(&[0x01, 0x7e]), Err(Corruption::DanglingEscape));
        assert_eq!(unescape(&[0x7e, 0x00, 0x7e, 0x06]), Ok(vec![0x7e, 0xa5]));
    }

    #[test]
    fn keeps_trailing_marker_half() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x01, 0x02, 0x7e][..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], &[0x7e]);
        assert_eq!(codec.take_stats().noise_bytes, 2);
    }

    #[test]
    fn runt_frame_is_corrupt() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x7e, 0x07, 0x80, 0x01, 0x7e, 0x08][..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        let stats = codec.take_stats();
        assert_eq!(stats.corrupt, 1);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn unterminated_candidate_is_bounded() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&START);
        buf.put_bytes(0x55, MAX_FRAME_SIZE);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.len() < MAX_FRAME_SIZE);
        assert_eq!(codec.take_stats().corrupt, 1);
    }

    #[test]
    fn decode_eof_discards_partial_frame() {
        let mut codec = FrameCodec::new();
        let full = encode(Frame::from_gateway(1, FrameType::PingResponse, vec![1, 2, 3]));
        let mut buf = BytesMut::from(&full[..full.len() - 3]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_address_bits() {
        let frame = Frame::from_gateway(0x1234, FrameType::ReceiveResponse, vec![]);
        assert!(frame.is_from_gateway());
        assert_eq!(frame.gateway_id(), 0x1234);
        assert_eq!(frame.frame_type(), Some(FrameType::ReceiveResponse));

        let frame = Frame { address: 0x0001, frame_type: 0xffff, payload: vec![] };
        assert!(!frame.is_from_gateway());
        assert_eq!(frame.frame_type(), None);
    }
}
