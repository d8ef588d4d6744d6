use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSecondsWithFrac};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub gateway: Gateway,
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_node_table")]
    pub node_table: PathBuf,

    /// Seconds; 0 disables duplicate suppression
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "Config::default_dedup_window")]
    pub dedup_window: Duration,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Gateway {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Gateway {
    pub serial: Option<SerialPort>,
    pub tcp: Option<Tcp>,
    pub read_timeout: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SerialPort {
    pub port: String,
    #[serde(default = "Config::default_baud_rate")]
    pub baud_rate: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tcp {
    pub host: String,
    #[serde(default = "Config::default_tcp_port")]
    pub port: u16,
}

#[derive(Clone, Debug)]
pub enum Transport {
    Serial(SerialPort),
    Tcp(Tcp),
}

impl Gateway {
    pub fn transport(&self) -> Result<Transport> {
        match (&self.serial, &self.tcp) {
            (Some(serial), None) => Ok(Transport::Serial(serial.clone())),
            (None, Some(tcp)) => Ok(Transport::Tcp(tcp.clone())),
            (Some(_), Some(_)) => bail!("gateway: configure either serial or tcp, not both"),
            (None, None) => bail!("gateway: no serial or tcp connection configured"),
        }
    }

    // seconds without data before the connection is considered dead; 0 = never
    pub fn read_timeout(&self) -> u64 {
        self.read_timeout.unwrap_or(0)
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.transport() {
            Ok(Transport::Serial(s)) => write!(f, "serial:{}@{}", s.port, s.baud_rate),
            Ok(Transport::Tcp(t)) => write!(f, "tcp:{}:{}", t.host, t.port),
            Err(_) => write!(f, "unconfigured"),
        }
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: &str) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.config.gateway
    }

    pub fn mqtt(&self) -> &Mqtt {
        &self.config.mqtt
    }

    pub fn node_table(&self) -> &Path {
        &self.config.node_table
    }

    pub fn dedup_window(&self) -> Duration {
        self.config.dedup_window
    }

    pub fn loglevel(&self) -> &str {
        &self.config.loglevel
    }

    pub fn log_summary(&self) {
        let c = &self.config;

        info!("Configuration loaded successfully:");
        info!("  Gateway: {}", c.gateway);
        info!("    Read Timeout: {}s", c.gateway.read_timeout());
        info!("  MQTT: {}", if c.mqtt.enabled { "enabled" } else { "disabled" });
        if c.mqtt.enabled {
            info!("    Host: {}", c.mqtt.host);
            info!("    Port: {}", c.mqtt.port);
            info!("    Namespace: {}", c.mqtt.namespace);
        }
        info!("  Node Table: {}", c.node_table.display());
        if c.dedup_window.is_zero() {
            info!("  Dedup Window: disabled");
        } else {
            info!("  Dedup Window: {:.1}s", c.dedup_window.as_secs_f64());
        }
        info!("  Log Level: {}", c.loglevel);
    }
}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        content.parse()
    }

    fn validate(&self) -> Result<()> {
        match self.gateway.transport()? {
            Transport::Serial(serial) => {
                if serial.port.is_empty() {
                    bail!("gateway.serial.port cannot be empty");
                }
                if serial.baud_rate == 0 {
                    bail!("gateway.serial.baud_rate must be positive");
                }
            }
            Transport::Tcp(tcp) => {
                if tcp.host.is_empty() {
                    bail!("gateway.tcp.host cannot be empty");
                }
                if tcp.port == 0 {
                    bail!("gateway.tcp.port must be between 1 and 65535");
                }
            }
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
            if self.mqtt.namespace.is_empty() {
                bail!("mqtt.namespace cannot be empty");
            }
        }

        if self.node_table.as_os_str().is_empty() {
            bail!("node_table cannot be empty");
        }

        if log::LevelFilter::from_str(&self.loglevel).is_err() {
            bail!("loglevel {:?} is not a valid log level", self.loglevel);
        }

        Ok(())
    }

    fn default_node_table() -> PathBuf {
        PathBuf::from("./nodeTable.json")
    }

    fn default_dedup_window() -> Duration {
        Duration::from_secs(5)
    }

    fn default_baud_rate() -> u32 {
        38400
    }

    fn default_tcp_port() -> u16 {
        7160
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "tigo".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

impl std::str::FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
