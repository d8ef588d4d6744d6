use crate::prelude::*;
use crate::config::Transport;
use crate::coordinator::PacketStats;
use crate::tigo::frame::FrameCodec;

use {
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt},
    tokio_serial::SerialPortBuilderExt,
    tokio_util::codec::Decoder,
};

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Connected,
    Disconnect,
    Frame(Frame),
    Shutdown,
}
pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

type Reader = Box<dyn AsyncRead + Send + Unpin>;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const RECONNECT_DELAY_SECS: u64 = 5;
const TCP_KEEPALIVE_SECS: u64 = 60;
const READ_BUFFER_SIZE: usize = 4096;

/// Reads the gateway's byte stream and forwards validated frames to the
/// coordinator. Owns connect and reconnect.
#[derive(Clone)]
pub struct Gateway {
    config: ConfigWrapper,
    channels: Channels,
    shared_stats: Arc<Mutex<PacketStats>>,
}

impl Gateway {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: Arc<Mutex<PacketStats>>) -> Self {
        Self {
            config,
            channels,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut to_gateway_rx = self.channels.to_gateway.subscribe();
        let gateway = self.config.gateway().clone();

        loop {
            let mut connected = false;
            let session = async {
                let reader = match self.connect().await {
                    Ok(reader) => reader,
                    Err(e) => {
                        if let Ok(mut stats) = self.shared_stats.lock() {
                            stats.connect_failures += 1;
                        }
                        return Err(e);
                    }
                };
                connected = true;
                let _ = self.channels.from_gateway.send(ChannelData::Connected);
                self.receiver(reader).await
            };

            tokio::select! {
                _ = Self::wait_for_shutdown(&mut to_gateway_rx) => break,
                res = session => {
                    if let Err(e) = res {
                        error!("gateway {}: {}", gateway, e);
                    }
                }
            }

            if connected {
                if let Ok(mut stats) = self.shared_stats.lock() {
                    stats.disconnections += 1;
                }
                let _ = self.channels.from_gateway.send(ChannelData::Disconnect);
            }

            info!("gateway {}: reconnecting in {}s", gateway, RECONNECT_DELAY_SECS);
            tokio::select! {
                _ = Self::wait_for_shutdown(&mut to_gateway_rx) => break,
                _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
            }
        }

        info!("gateway {}: received shutdown signal", gateway);
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_gateway.send(ChannelData::Shutdown);
    }

    async fn wait_for_shutdown(receiver: &mut Receiver) {
        loop {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn connect(&self) -> Result<Reader> {
        let gateway = self.config.gateway();
        info!("connecting to gateway at {}", gateway);

        let reader: Reader = match gateway.transport()? {
            Transport::Tcp(tcp) => {
                let stream = match tokio::time::timeout(
                    Duration::from_secs(CONNECT_TIMEOUT_SECS),
                    tokio::net::TcpStream::connect((tcp.host.as_str(), tcp.port)),
                )
                .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => bail!("Failed to connect: {}", e),
                    Err(_) => bail!("Connection timeout after {} seconds", CONNECT_TIMEOUT_SECS),
                };

                let std_stream = stream.into_std()?;
                if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
                    warn!("Failed to set TCP keepalive: {}", e);
                }

                Box::new(tokio::net::TcpStream::from_std(std_stream)?)
            }
            Transport::Serial(serial) => {
                let port = tokio_serial::new(&serial.port, serial.baud_rate)
                    .open_native_async()
                    .map_err(|e| anyhow!("Failed to open serial port {}: {}", serial.port, e))?;

                Box::new(port)
            }
        };

        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.connections += 1;
        }
        info!("gateway {}: connected!", gateway);

        Ok(reader)
    }

    /// Reads until the stream ends or fails. Every call starts with an empty
    /// buffer, so a partial frame never survives a reconnect.
    pub async fn receiver<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<()> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut decoder = FrameCodec::new();
        let read_timeout = self.config.gateway().read_timeout();

        loop {
            let read = if read_timeout > 0 {
                tokio::time::timeout(Duration::from_secs(read_timeout), reader.read_buf(&mut buf))
                    .await
                    .map_err(|_| anyhow!("No data received for {} seconds", read_timeout))?
            } else {
                reader.read_buf(&mut buf).await
            };

            let len = read.map_err(|e| anyhow!("Read error: {}", e))?;

            if len == 0 {
                while let Some(frame) = decoder.decode_eof(&mut buf)? {
                    self.forward(frame);
                }
                self.record_stats(&mut decoder);
                bail!("Connection closed by peer");
            }

            trace!("gateway: RX {} bytes", len);
            while let Some(frame) = decoder.decode(&mut buf)? {
                self.forward(frame);
            }
            self.record_stats(&mut decoder);
        }
    }

    fn forward(&self, frame: Frame) {
        debug!("gateway: {}", frame);
        if self.channels.from_gateway.send(ChannelData::Frame(frame)).is_err() {
            warn!("send(from_gateway) failed - channel closed?");
        }
    }

    fn record_stats(&self, decoder: &mut FrameCodec) {
        let frame_stats = decoder.take_stats();
        if let Ok(mut stats) = self.shared_stats.lock() {
            stats.add_frame_stats(frame_stats);
        }
    }
}
