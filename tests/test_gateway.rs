mod common;
use common::*;
use tigo_bridge::prelude::*;
use tigo_bridge::coordinator::PacketStats;

use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[tokio::test]
async fn receiver_forwards_frames_until_eof() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;
    let config = Factory::config(5.0, &dir.path().join("nodeTable.json"));
    let channels = Channels::new();
    let stats = Arc::new(Mutex::new(PacketStats::default()));
    let gateway = Gateway::new(config, channels.clone(), stats.clone());

    let a = Factory::receive_response(1, &[Factory::power_packet(10, 600)]);
    let b = Factory::receive_response(1, &[Factory::topology_packet(10, &Factory::address(1).bytes())]);

    let mut stream = vec![0x13, 0x37];
    stream.extend(Factory::encode(a.clone()));
    stream.extend(Factory::encode(b.clone()));
    // cut off mid-frame
    stream.extend(&Factory::encode(a.clone())[..6]);

    let mut from_gateway = channels.from_gateway.subscribe();

    let err = gateway.receiver(&stream[..]).await.unwrap_err();
    assert!(err.to_string().contains("closed"));

    assert_eq!(from_gateway.try_recv()?, gateway::ChannelData::Frame(a));
    assert_eq!(from_gateway.try_recv()?, gateway::ChannelData::Frame(b));
    assert!(from_gateway.try_recv().is_err());

    let stats = stats.lock().unwrap().clone();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.noise_bytes, 2);

    Ok(())
}

#[tokio::test]
async fn receiver_feeds_coordinator() -> Result<()> {
    common_setup();

    let dir = TempDir::new()?;
    let config = Factory::config(5.0, &dir.path().join("nodeTable.json"));
    let channels = Channels::new();
    let node_table = NodeTable::empty(config.node_table());
    let coordinator = Coordinator::new(config.clone(), channels.clone(), node_table);
    let gateway = Gateway::new(config, channels.clone(), coordinator.shared_stats.clone());

    let mut to_mqtt = channels.to_mqtt.subscribe();
    let task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.start().await })
    };
    tokio::task::yield_now().await;

    let mut stream = Factory::encode(Factory::receive_response(
        2,
        &[Factory::topology_packet(10, &Factory::address(9).bytes())],
    ));
    stream.extend(Factory::encode(Factory::receive_response(2, &[Factory::power_packet(10, 600)])));

    let _ = gateway.receiver(&stream[..]).await;
    coordinator.stop();
    task.await??;

    match to_mqtt.try_recv()? {
        mqtt::ChannelData::Message(message) => {
            assert_eq!(message.topic, Factory::address(9).to_string());
        }
        other => panic!("unexpected {:?}", other),
    }

    Ok(())
}
