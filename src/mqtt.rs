use crate::prelude::*;
use crate::coordinator::PacketStats;
use crate::tigo::report::PowerReport;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLIENT_ID: &str = "tigo-bridge";
const KEEP_ALIVE_SECS: u64 = 30;
const PUBLISH_ATTEMPTS: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;
const RECONNECT_DELAY_SECS: u64 = 5;
const DISCONNECT_GRACE_SECS: u64 = 10;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    /// Relative to the configured namespace.
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Published body of one power report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "NodeID")]
    pub node_id: u16,
    #[serde(rename = "VIN")]
    pub voltage_in: f64,
    #[serde(rename = "VOUT")]
    pub voltage_out: f64,
    #[serde(rename = "DUTY")]
    pub duty_cycle: f64,
    #[serde(rename = "AMPSIN")]
    pub current_in: f64,
    #[serde(rename = "TEMP")]
    pub temperature: f64,
    #[serde(rename = "RSSI")]
    pub rssi: Option<u8>,
    #[serde(rename = "SLOT")]
    pub slot: u16,
    #[serde(rename = "POWER")]
    pub power: f64,
    #[serde(rename = "Address")]
    pub address: Option<LongAddress>,
    #[serde(rename = "GatewayID")]
    pub gateway_id: u16,
    /// Seconds since the epoch, with fraction.
    #[serde(rename = "Timestamp")]
    pub timestamp: f64,
}

impl Record {
    pub fn new(report: &PowerReport, address: Option<LongAddress>) -> Self {
        Self {
            node_id: report.node_id,
            voltage_in: round(report.voltage_in, 2),
            voltage_out: round(report.voltage_out, 2),
            duty_cycle: round(report.duty_cycle, 2),
            current_in: round(report.current_in, 3),
            temperature: round(report.temperature, 1),
            rssi: report.rssi,
            slot: report.slot,
            power: round(report.power, 2),
            address,
            gateway_id: report.gateway_id,
            timestamp: report.captured_at.timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

impl Message {
    /// Nodes without a known address are published under their node id.
    pub fn for_power_report(report: &PowerReport, address: Option<LongAddress>) -> Result<Message> {
        let topic = match address {
            Some(address) => address.to_string(),
            None => report.node_id.to_string(),
        };

        Ok(Message {
            topic,
            retain: true,
            payload: serde_json::to_string(&Record::new(report, address))?,
        })
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    shared_stats: Arc<Mutex<PacketStats>>,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: Arc<Mutex<PacketStats>>) -> Self {
        Self {
            config,
            channels,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        // subscribe before anything else so an early shutdown is not missed
        let shutdown_rx = self.channels.to_mqtt.subscribe();
        let messages_rx = self.channels.to_mqtt.subscribe();

        if !c.mqtt().enabled() {
            info!("mqtt disabled, records will only be logged");
            return self.discard(messages_rx).await;
        }

        let mut options = MqttOptions::new(CLIENT_ID, c.mqtt().host(), c.mqtt().port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        if let (Some(u), Some(p)) = (c.mqtt().username(), c.mqtt().password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.mqtt().host(), c.mqtt().port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.receiver(client.clone(), eventloop, shutdown_rx),
            self.sender(client, messages_rx)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    // drives the connection; announces "online" on every (re)connect
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop, mut shutdown_rx: Receiver) -> Result<()> {
        loop {
            tokio::select! {
                _ = Self::wait_for_shutdown(&mut shutdown_rx) => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        if let Err(e) = client.try_publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online") {
                            warn!("failed to publish online status: {}", e);
                        }
                    }
                    Err(e) => self.connection_error(e).await,
                    _ => {} // keepalives etc
                },
            }
        }

        // the sender drains its queue and then disconnects; keep the
        // connection driven until that happens
        let _ = tokio::time::timeout(Duration::from_secs(DISCONNECT_GRACE_SECS), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    _ => {}
                }
            }
        })
        .await;

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    async fn connection_error(&self, e: ConnectionError) {
        error!("mqtt: {}", e);
        info!("reconnecting in {}s", RECONNECT_DELAY_SECS);
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient, mut receiver: Receiver) -> Result<()> {
        use ChannelData::*;

        loop {
            match receiver.recv().await {
                Ok(Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Ok(Message(message)) => self.publish(&client, message).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("mqtt sender fell behind, {} messages lost", n);
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
        debug!("publishing: {} = {}", topic, message.payload);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                .await
            {
                Ok(_) => {
                    self.with_stats(|s| s.mqtt_messages_sent += 1);
                    return;
                }
                Err(err) => {
                    self.with_stats(|s| s.mqtt_errors += 1);
                    if attempt < PUBLISH_ATTEMPTS {
                        warn!(
                            "MQTT publish failed: {} - retrying in {}s (attempt {}/{})",
                            err, RETRY_DELAY_SECS, attempt, PUBLISH_ATTEMPTS
                        );
                        tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
                    } else {
                        error!("MQTT publish to {} failed, giving up: {}", topic, err);
                    }
                }
            }
        }
    }

    // used when mqtt is disabled so records still show up somewhere
    async fn discard(&self, mut receiver: Receiver) -> Result<()> {
        loop {
            match receiver.recv().await {
                Ok(ChannelData::Message(message)) => {
                    debug!("mqtt disabled, not publishing {} = {}", message.topic, message.payload);
                }
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }

        Ok(())
    }

    async fn wait_for_shutdown(receiver: &mut Receiver) {
        loop {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    fn with_stats<F: FnOnce(&mut PacketStats)>(&self, f: F) {
        if let Ok(mut stats) = self.shared_stats.lock() {
            f(&mut stats);
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
