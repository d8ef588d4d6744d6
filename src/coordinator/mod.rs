use crate::prelude::*;
use crate::tigo::frame::FrameStats;
use crate::tigo::gateway::ChannelData;
use crate::tigo::report::{Parser, PowerReport, Report, TopologyEntry};

use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Default, Debug, Clone)]
pub struct PacketStats {
    // gateway link
    pub connections: u64,
    pub connect_failures: u64,
    pub disconnections: u64,
    pub frames_received: u64,
    pub corrupt_frames: u64,
    pub noise_bytes: u64,
    // decoding
    pub power_reports: u64,
    pub topology_reports: u64,
    pub other_reports: u64,
    pub decode_errors: u64,
    // publishing
    pub duplicates_suppressed: u64,
    pub unknown_addresses: u64,
    pub node_table_updates: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
}

impl PacketStats {
    pub fn add_frame_stats(&mut self, stats: FrameStats) {
        self.frames_received += stats.frames;
        self.corrupt_frames += stats.corrupt;
        self.noise_bytes += stats.noise_bytes;
    }

    pub fn print_summary(&self) {
        info!("Packet Statistics:");
        info!("  Gateway:");
        info!("    Connections: {}", self.connections);
        info!("    Failed connects: {}", self.connect_failures);
        info!("    Disconnections: {}", self.disconnections);
        info!("    Frames received: {}", self.frames_received);
        info!("    Corrupt frames dropped: {}", self.corrupt_frames);
        info!("    Noise bytes discarded: {}", self.noise_bytes);
        info!("  Reports:");
        info!("    Power reports: {}", self.power_reports);
        info!("    Topology reports: {}", self.topology_reports);
        info!("    Other reports: {}", self.other_reports);
        info!("    Decode errors: {}", self.decode_errors);
        info!("  Publishing:");
        info!("    Duplicates suppressed: {}", self.duplicates_suppressed);
        info!("    Reports without address: {}", self.unknown_addresses);
        info!("    Node table updates: {}", self.node_table_updates);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
    }
}

/// Turns frames from the gateway into MQTT messages: decodes reports, keeps
/// the node table current, drops duplicate power reports and resolves
/// addresses before handing records to the publisher.
#[derive(Clone)]
pub struct Coordinator {
    channels: Channels,
    node_table: NodeTable,
    dedup: Arc<Mutex<Deduplicator>>,
    pub shared_stats: Arc<Mutex<PacketStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels, node_table: NodeTable) -> Self {
        Self {
            channels,
            node_table,
            dedup: Arc::new(Mutex::new(Deduplicator::new(config.dedup_window()))),
            shared_stats: Arc::new(Mutex::new(PacketStats::default())),
        }
    }

    pub fn stop(&self) {
        let _ = self.channels.from_gateway.send(ChannelData::Shutdown);
    }

    pub async fn start(&self) -> Result<()> {
        let mut receiver = self.channels.from_gateway.subscribe();

        if let Ok(dedup) = self.dedup.lock() {
            if dedup.enabled() {
                info!("coordinator started, suppressing repeats within {:.1}s", dedup.window().as_secs_f64());
            } else {
                info!("coordinator started, publishing every report");
            }
        }

        loop {
            match receiver.recv().await {
                Ok(ChannelData::Frame(frame)) => self.process_frame(&frame),
                Ok(ChannelData::Connected) => info!("gateway connected"),
                Ok(ChannelData::Disconnect) => info!("gateway disconnected"),
                Ok(ChannelData::Shutdown) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("coordinator fell behind, {} frames lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("coordinator exiting");
        Ok(())
    }

    pub fn process_frame(&self, frame: &Frame) {
        let packets = match Parser::parse(frame) {
            Ok(packets) => packets,
            Err(e) => {
                warn!("dropping {}: {}", frame, e);
                self.with_stats(|s| s.decode_errors += 1);
                return;
            }
        };

        let captured_at = chrono::Utc::now();
        let now = Instant::now();

        for packet in packets {
            match Report::decode(frame.gateway_id(), &packet, captured_at) {
                Ok(Report::Power(report)) => {
                    self.with_stats(|s| s.power_reports += 1);
                    self.handle_power_report(report, now);
                }
                Ok(Report::Topology(entry)) => {
                    self.with_stats(|s| s.topology_reports += 1);
                    self.handle_topology(entry);
                }
                Ok(Report::Other(packet_type)) => {
                    self.with_stats(|s| s.other_reports += 1);
                    trace!(
                        "ignoring packet type {:#04x} ({:?}) from node {}",
                        packet_type,
                        tigo::report::PacketType::try_from(packet_type).ok(),
                        packet.header.node_id
                    );
                }
                Err(e) => {
                    self.with_stats(|s| s.decode_errors += 1);
                    warn!("dropping packet from node {}: {}", packet.header.node_id, e);
                }
            }
        }
    }

    fn handle_topology(&self, entry: TopologyEntry) {
        debug!("topology: node {} -> {}", entry.node_id, entry.address);

        if self.node_table.upsert(entry.node_id, entry.address) {
            info!("Node Table Updated: Node {} -> {}", entry.node_id, entry.address);
            self.with_stats(|s| s.node_table_updates += 1);
            self.node_table.persist_in_background();
        }
    }

    fn handle_power_report(&self, report: PowerReport, now: Instant) {
        let accepted = match self.dedup.lock() {
            Ok(mut dedup) => dedup.accept(&report, now),
            Err(_) => true,
        };
        if !accepted {
            debug!("skipping duplicate report for node {}", report.node_id);
            self.with_stats(|s| s.duplicates_suppressed += 1);
            return;
        }

        let address = self.node_table.lookup(report.node_id);
        if address.is_none() {
            debug!("no address known yet for node {}", report.node_id);
            self.with_stats(|s| s.unknown_addresses += 1);
        }

        info!("power report: {}", report);

        match mqtt::Message::for_power_report(&report, address) {
            Ok(message) => {
                if self
                    .channels
                    .to_mqtt
                    .send(mqtt::ChannelData::Message(message))
                    .is_err()
                {
                    warn!("send(to_mqtt) failed - channel closed?");
                }
            }
            Err(e) => error!("failed to build record for node {}: {}", report.node_id, e),
        }
    }

    fn with_stats<F: FnOnce(&mut PacketStats)>(&self, f: F) {
        if let Ok(mut stats) = self.shared_stats.lock() {
            f(&mut stats);
        }
    }
}
