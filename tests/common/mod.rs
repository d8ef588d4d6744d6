#![allow(dead_code)]

use tigo_bridge::prelude::*;
use tigo_bridge::tigo::frame::{FrameCodec, FrameType};
use tigo_bridge::tigo::report::PacketType;

use bytes::BytesMut;
use std::path::Path;
use tokio_util::codec::Encoder;

pub fn common_setup() {
    tigo_bridge::init_logging("debug");
}

pub struct Factory;
impl Factory {
    pub fn config(dedup_window: f64, node_table: &Path) -> ConfigWrapper {
        let yaml = format!(
            "
gateway:
  tcp:
    host: 127.0.0.1
    port: 1
mqtt:
  enabled: false
  host: localhost
node_table: \"{}\"
dedup_window: {}
",
            node_table.display(),
            dedup_window
        );

        ConfigWrapper::from_config(yaml.parse().unwrap())
    }

    pub fn address(last: u8) -> LongAddress {
        LongAddress::new([0x04, 0xc0, 0x5b, 0x30, 0x00, 0x01, 0x02, last])
    }

    // 30.00V in, 30.0V out, 100% duty, 5.000A, 25.0C, slot 0x0102, rssi 0x7b
    pub fn power_data(voltage_in: u16) -> Vec<u8> {
        vec![
            (voltage_in >> 4) as u8,
            ((voltage_in & 0x0f) << 4) as u8 | 0x01,
            0x2c,
            0xff,
            0x3e,
            0x80,
            0xfa,
            0x00,
            0x00,
            0x00,
            0x01,
            0x02,
            0x7b,
        ]
    }

    pub fn packet(packet_type: PacketType, node_id: u16, data: &[u8]) -> Vec<u8> {
        let mut r = vec![u8::from(packet_type)];
        r.extend_from_slice(&node_id.to_be_bytes());
        r.extend_from_slice(&[0x00, 0x00]); // short address
        r.push(0x00); // dsn
        r.push(data.len() as u8);
        r.extend_from_slice(data);
        r
    }

    pub fn power_packet(node_id: u16, voltage_in: u16) -> Vec<u8> {
        Self::packet(PacketType::PowerReport, node_id, &Self::power_data(voltage_in))
    }

    pub fn topology_packet(node_id: u16, address: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        data.extend_from_slice(address);
        data.extend_from_slice(&[0xc8, 0x00, 0x00]);
        Self::packet(PacketType::TopologyReport, node_id, &data)
    }

    pub fn receive_response(gateway_id: u16, packets: &[Vec<u8>]) -> Frame {
        // minimal status type, no status body, zero slot counter
        let mut payload = vec![0x00, 0xff, 0x00, 0x00, 0x00];
        for packet in packets {
            payload.extend_from_slice(packet);
        }
        Frame::from_gateway(gateway_id, FrameType::ReceiveResponse, payload)
    }

    pub fn encode(frame: Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf.to_vec()
    }
}
