pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::broadcast;

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::coordinator::{self, Coordinator};
pub use crate::dedup::Deduplicator;
pub use crate::mqtt::{self, Mqtt};
pub use crate::node_table::NodeTable;
pub use crate::options::Options;
pub use crate::tigo::{self, frame::Frame, gateway::{self, Gateway}, report::LongAddress};
