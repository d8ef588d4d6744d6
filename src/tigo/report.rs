use crate::prelude::*;
use crate::tigo::frame::FrameType;

use chrono::{DateTime, Utc};
use nom::bits::{bits, complete::take};
use nom::sequence::tuple;
use nom::IResult;
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// {{{ PacketType
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    StringRequest = 0x06,
    StringResponse = 0x07,
    TopologyReport = 0x09,
    GatewayRadioConfigRequest = 0x0d,
    GatewayRadioConfigResponse = 0x0e,
    PvConfigRequest = 0x13,
    PvConfigResponse = 0x18,
    Broadcast = 0x22,
    BroadcastAck = 0x23,
    NodeTableRequest = 0x26,
    NodeTableResponse = 0x27,
    LongNetworkStatusRequest = 0x2d,
    NetworkStatusRequest = 0x2e,
    NetworkStatusResponse = 0x2f,
    PowerReport = 0x31,
    Unknown41 = 0x41,
}
// }}}

// {{{ StatusType
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum StatusType {
    Full = 0x00e0,
    PacketHigh = 0x00ee,
    RxBuffers = 0x00fe,
    Minimal = 0x00ff,
}

impl StatusType {
    fn body_len(self) -> usize {
        match self {
            Self::Full => 7,
            Self::PacketHigh => 2,
            Self::RxBuffers => 1,
            Self::Minimal => 0,
        }
    }
}
// }}}

const SLOT_COUNTER_LEN: usize = 3;

// {{{ LongAddress
const LONG_ADDRESS_LEN: usize = 8;
const HEX_FORM_LEN: usize = LONG_ADDRESS_LEN * 2;
const COLON_FORM_LEN: usize = LONG_ADDRESS_LEN * 3 - 1;

/// Hardware address of an optimizer node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LongAddress([u8; LONG_ADDRESS_LEN]);

impl LongAddress {
    pub fn new(bytes: [u8; LONG_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; LONG_ADDRESS_LEN] {
        self.0
    }

    /// Normalizes an address as it appears on the wire or in a stored table:
    /// either the 8 packed bytes, or ASCII text in colon-separated or bare hex.
    pub fn from_wire(input: &[u8]) -> Result<Self> {
        if input.len() == LONG_ADDRESS_LEN {
            return Ok(Self(input.try_into()?));
        }

        let text = std::str::from_utf8(input)
            .map_err(|_| anyhow!("{} byte address is neither packed nor text", input.len()))?;
        text.parse()
    }
}

impl std::str::FromStr for LongAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let parts: Vec<&str> = match s.len() {
            COLON_FORM_LEN => s.split(':').collect(),
            HEX_FORM_LEN => (0..HEX_FORM_LEN)
                .step_by(2)
                .filter_map(|i| s.get(i..i + 2))
                .collect(),
            _ => bail!("{:?} is not an 8 byte address", s),
        };

        if parts.len() != LONG_ADDRESS_LEN
            || parts
                .iter()
                .any(|p| p.len() != 2 || !p.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            bail!("{:?} is not an 8 byte address", s);
        }

        let mut r = [0; LONG_ADDRESS_LEN];
        for (byte, part) in r.iter_mut().zip(parts) {
            *byte = u8::from_str_radix(part, 16)?;
        }

        Ok(Self(r))
    }
}

impl std::fmt::Display for LongAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", hex.join(":"))
    }
}

impl std::fmt::Debug for LongAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LongAddress({})", self)
    }
}

impl Serialize for LongAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LongAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Stored {
            Text(String),
            Bytes(Vec<u8>),
        }

        match Stored::deserialize(deserializer)? {
            Stored::Text(s) => s.parse(),
            Stored::Bytes(b) => Self::from_wire(&b),
        }
        .map_err(serde::de::Error::custom)
    }
} // }}}

// {{{ Packet
#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub node_id: u16,
    pub short_address: u16,
    pub dsn: u8,
    pub length: u8,
}

/// One report embedded in a receive response, still undecoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub data: Vec<u8>,
}

pub struct Parser;
impl Parser {
    /// Splits a receive response into its embedded packets. Frames that do
    /// not carry reports yield no packets.
    pub fn parse(frame: &Frame) -> Result<Vec<Packet>> {
        if !frame.is_from_gateway() {
            return Ok(Vec::new());
        }

        match frame.frame_type() {
            Some(FrameType::ReceiveResponse) => {}
            frame_type => {
                trace!("ignoring {:?} ({})", frame_type, frame);
                return Ok(Vec::new());
            }
        }

        let payload = &frame.payload;
        if payload.len() < 2 {
            bail!("receive response too short: {} bytes", payload.len());
        }

        let status = u16::from_be_bytes([payload[0], payload[1]]);
        let status = match StatusType::try_from(status) {
            Ok(status) => status,
            Err(_) => {
                debug!("ignoring receive response with status type {:04x}", status);
                return Ok(Vec::new());
            }
        };

        let offset = 2 + status.body_len() + SLOT_COUNTER_LEN;
        if payload.len() < offset {
            bail!(
                "receive response too short for {:?} status: {} bytes",
                status,
                payload.len()
            );
        }

        let mut r = Vec::new();
        let mut input = &payload[offset..];

        while !input.is_empty() {
            let (rest, header) = match PacketHeader::parse(input) {
                Ok(v) => v,
                Err(_) => {
                    debug!("truncated packet header ({} bytes) at end of receive response", input.len());
                    break;
                }
            };

            let len = header.length as usize;
            if rest.len() < len {
                debug!(
                    "truncated packet from node {}: {} of {} bytes",
                    header.node_id,
                    rest.len(),
                    len
                );
                break;
            }

            r.push(Packet {
                header,
                data: rest[..len].to_vec(),
            });
            input = &rest[len..];
        }

        Ok(r)
    }
} // }}}

// {{{ PowerReport
const VIN_SCALE: f64 = 0.05;
const VOUT_SCALE: f64 = 0.10;
const CURRENT_SCALE: f64 = 0.005;
const TEMPERATURE_SCALE: f64 = 0.1;

/// Measurements exactly as they arrived, before scaling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub struct RawReadings {
    pub voltage_in: u16,
    pub voltage_out: u16,
    pub duty_cycle: u8,
    pub current_in: u16,
    pub temperature: u16,
}

type BitInput<'a> = (&'a [u8], usize);

fn take12(input: BitInput) -> IResult<BitInput, u16> {
    take(12usize)(input)
}

fn take8(input: BitInput) -> IResult<BitInput, u8> {
    take(8usize)(input)
}

fn raw_readings(input: &[u8]) -> IResult<&[u8], RawReadings> {
    let (input, (voltage_in, voltage_out, duty_cycle, current_in, temperature)) =
        bits(tuple((take12, take12, take8, take12, take12)))(input)?;

    Ok((
        input,
        RawReadings {
            voltage_in,
            voltage_out,
            duty_cycle,
            current_in,
            temperature,
        },
    ))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PowerReport {
    pub node_id: u16,
    pub gateway_id: u16,
    pub raw: RawReadings,
    pub voltage_in: f64,
    pub voltage_out: f64,
    pub duty_cycle: f64,
    pub current_in: f64,
    pub temperature: f64,
    pub power: f64,
    pub rssi: Option<u8>,
    pub slot: u16,
    pub captured_at: DateTime<Utc>,
}

impl PowerReport {
    pub const MIN_LEN: usize = 12;

    pub fn decode(
        gateway_id: u16,
        node_id: u16,
        data: &[u8],
        captured_at: DateTime<Utc>,
    ) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            bail!("power report too short: {} bytes", data.len());
        }

        let (_, raw) = raw_readings(data)
            .map_err(|err| anyhow!("power report readings: {:?}", err.map_input(|i| i.len())))?;

        // bytes 7..10 are not understood yet
        let slot = u16::from_be_bytes([data[10], data[11]]);
        let rssi = data.get(12).copied();

        let voltage_in = raw.voltage_in as f64 * VIN_SCALE;
        let current_in = raw.current_in as f64 * CURRENT_SCALE;

        Ok(Self {
            node_id,
            gateway_id,
            raw,
            voltage_in,
            voltage_out: raw.voltage_out as f64 * VOUT_SCALE,
            duty_cycle: raw.duty_cycle as f64 / 255.0 * 100.0,
            current_in,
            temperature: raw.temperature as f64 * TEMPERATURE_SCALE,
            power: voltage_in * current_in,
            rssi,
            slot,
            captured_at,
        })
    }
}

impl std::fmt::Display for PowerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node {}: V={:.2}V, Vout={:.2}V, I={:.3}A, P={:.2}W, T={:.1}C, RSSI={}",
            self.node_id,
            self.voltage_in,
            self.voltage_out,
            self.current_in,
            self.power,
            self.temperature,
            self.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
        )
    }
} // }}}

// {{{ TopologyEntry
#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
struct TopologyHeader {
    short_address: u16,
    pv_node_id: u16,
    next_hop: u16,
    unknown: u16,
}

const TOPOLOGY_HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TopologyEntry {
    pub node_id: u16,
    pub gateway_id: u16,
    pub next_hop: u16,
    pub address: LongAddress,
}

impl TopologyEntry {
    pub fn decode(gateway_id: u16, node_id: u16, data: &[u8]) -> Result<Self> {
        let (rest, header) = TopologyHeader::parse(data)
            .map_err(|_| anyhow!("topology report too short: {} bytes", data.len()))?;

        Ok(Self {
            node_id,
            gateway_id,
            next_hop: header.next_hop,
            address: Self::address(rest)?,
        })
    }

    // some firmware sends the address pre-rendered as text; those forms are
    // longer than the packed one so they are tried first.
    fn address(input: &[u8]) -> Result<LongAddress> {
        for len in [COLON_FORM_LEN, HEX_FORM_LEN] {
            if let Some(address) = input.get(..len).and_then(|s| LongAddress::from_wire(s).ok()) {
                return Ok(address);
            }
        }

        match input.get(..LONG_ADDRESS_LEN) {
            Some(packed) => LongAddress::from_wire(packed),
            None => bail!(
                "topology report address truncated: {} bytes after {} byte header",
                input.len(),
                TOPOLOGY_HEADER_LEN
            ),
        }
    }
} // }}}

#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    Power(PowerReport),
    Topology(TopologyEntry),
    Other(u8),
}

impl Report {
    pub fn decode(gateway_id: u16, packet: &Packet, captured_at: DateTime<Utc>) -> Result<Self> {
        let node_id = packet.header.node_id;

        let r = match PacketType::try_from(packet.header.packet_type) {
            Ok(PacketType::PowerReport) => Self::Power(PowerReport::decode(
                gateway_id,
                node_id,
                &packet.data,
                captured_at,
            )?),
            Ok(PacketType::TopologyReport) => {
                Self::Topology(TopologyEntry::decode(gateway_id, node_id, &packet.data)?)
            }
            _ => Self::Other(packet.header.packet_type),
        };

        Ok(r)
    }
}
