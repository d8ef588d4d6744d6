mod common;
use common::*;
use tigo_bridge::prelude::*;
use tigo_bridge::tigo::frame::{FrameCodec, FrameStats, FrameType};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
    let mut r = Vec::new();
    while let Some(frame) = codec.decode(buf).unwrap() {
        r.push(frame);
    }
    r
}

fn frames() -> (Frame, Frame) {
    (
        Factory::receive_response(1, &[Factory::power_packet(10, 600)]),
        Frame::from_gateway(1, FrameType::PingResponse, vec![0x7e, 0x24, 0x01]),
    )
}

#[test]
fn recovers_frames_between_noise() {
    common_setup();

    let (a, b) = frames();
    let mut stream = vec![0x00, 0x7e, 0x42, 0x08];
    stream.extend(Factory::encode(a.clone()));
    stream.extend([0xff, 0x7e, 0x08, 0x13]);
    stream.extend(Factory::encode(b.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);

    assert_eq!(decode_all(&mut codec, &mut buf), vec![a, b]);
    assert!(buf.is_empty());

    let stats = codec.take_stats();
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.noise_bytes, 8);
}

#[test]
fn frames_split_across_reads() {
    common_setup();

    let (a, b) = frames();
    let mut stream = Factory::encode(a.clone());
    stream.extend(Factory::encode(b.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();

    for byte in stream {
        buf.extend_from_slice(&[byte]);
        decoded.extend(decode_all(&mut codec, &mut buf));
    }

    assert_eq!(decoded, vec![a, b]);
    assert_eq!(
        codec.take_stats(),
        FrameStats {
            frames: 2,
            corrupt: 0,
            noise_bytes: 0
        }
    );
}

#[test]
fn corrupt_frame_is_dropped_and_next_one_survives() {
    common_setup();

    let (a, b) = frames();
    let mut tampered = Factory::encode(a);
    // first byte of the slot counter, no escaping before it
    tampered[8] ^= 0x01;

    let mut stream = tampered;
    stream.extend(Factory::encode(b.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);

    assert_eq!(decode_all(&mut codec, &mut buf), vec![b]);

    let stats = codec.take_stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.corrupt, 1);
}

#[test]
fn start_marker_inside_corrupt_data_is_found() {
    common_setup();

    let (a, _) = frames();
    // a start marker whose frame never ends, immediately followed by a good frame
    let mut stream = vec![0x7e, 0x07, 0x80, 0x01];
    stream.extend(Factory::encode(a.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);

    assert_eq!(decode_all(&mut codec, &mut buf), vec![a]);
}

// flips the low bit without creating a bare 7e
fn flip(byte: &mut u8) {
    *byte = if *byte == 0x7f { 0x7d } else { *byte ^ 0x01 };
}

#[test]
fn tampered_checksum_byte_is_dropped() {
    common_setup();

    let (a, b) = frames();
    let mut stream = Factory::encode(a);
    let len = stream.len();
    // last body byte before the end marker is part of the checksum
    flip(&mut stream[len - 3]);
    stream.extend(Factory::encode(b.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);

    assert_eq!(decode_all(&mut codec, &mut buf), vec![b]);
    assert!(buf.is_empty());

    let stats = codec.take_stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.corrupt, 1);
}

#[test]
fn tampered_end_marker_does_not_swallow_next_frame() {
    common_setup();

    let (a, b) = frames();
    let mut stream = Factory::encode(a);
    let len = stream.len();
    // 7e 08 becomes 7e 09
    stream[len - 1] = 0x09;
    stream.extend(Factory::encode(b.clone()));

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&stream[..]);

    assert_eq!(decode_all(&mut codec, &mut buf), vec![b]);
    assert!(buf.is_empty());

    let stats = codec.take_stats();
    assert_eq!(stats.frames, 1);
    assert!(stats.corrupt >= 1);
}
