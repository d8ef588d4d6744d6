pub mod channels;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod mqtt;
pub mod node_table;
pub mod options;
pub mod prelude;
pub mod tigo;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use tokio::task::JoinHandle;

/// Installs the global logger. `level` is the default filter, RUST_LOG still
/// overrides it. Calling this twice is harmless.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Long running parts of the bridge and their tasks.
pub struct Components {
    pub gateway: Gateway,
    pub coordinator: Coordinator,
    pub mqtt: Mqtt,
    pub node_table: NodeTable,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Components {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let node_table = NodeTable::load(config.node_table());
        debug!("node table:\n{}", node_table.render());

        let coordinator = Coordinator::new(config.clone(), channels.clone(), node_table.clone());
        let stats = coordinator.shared_stats.clone();

        Self {
            gateway: Gateway::new(config.clone(), channels.clone(), stats.clone()),
            mqtt: Mqtt::new(config, channels, stats),
            coordinator,
            node_table,
            handles: Vec::new(),
        }
    }

    /// Spawns consumers before the producer so nothing sent early is missed.
    pub fn start(&mut self) {
        let mqtt = self.mqtt.clone();
        self.spawn("mqtt", async move { mqtt.start().await });

        let coordinator = self.coordinator.clone();
        self.spawn("coordinator", async move { coordinator.start().await });

        let gateway = self.gateway.clone();
        self.spawn("gateway", async move { gateway.start().await });
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        info!("  Starting {}...", name);
        let handle = tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        });
        self.handles.push((name, handle));
    }

    /// Stops the input first and lets every stage drain what is already
    /// queued before the next one is told to stop.
    pub async fn stop(&mut self) {
        info!("Stopping all components...");

        self.gateway.stop();
        self.join("gateway").await;

        self.coordinator.stop();
        self.join("coordinator").await;

        let node_table = self.node_table.clone();
        match tokio::task::spawn_blocking(move || node_table.flush()).await {
            Ok(Ok(())) => info!("node table saved ({} nodes)", self.node_table.len()),
            Ok(Err(e)) => error!("Failed to save node table: {}", e),
            Err(e) => error!("node table flush panicked: {}", e),
        }

        self.mqtt.stop();
        self.join("mqtt").await;

        if let Ok(stats) = self.coordinator.shared_stats.lock() {
            stats.print_summary();
        }

        info!("Shutdown complete");
    }

    async fn join(&mut self, name: &str) {
        if let Some(i) = self.handles.iter().position(|(n, _)| *n == name) {
            let (_, handle) = self.handles.remove(i);
            if let Err(e) = handle.await {
                error!("Error waiting for {} task: {}", name, e);
            }
        }
    }
}

/// Runs the bridge until `shutdown_rx` fires.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, config: ConfigWrapper) -> Result<()> {
    info!("tigo-bridge {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    let channels = Channels::new();
    let mut components = Components::new(config, channels);
    components.start();

    info!("Waiting for shutdown signal...");
    let _ = shutdown_rx.recv().await;

    info!("Shutdown signal received, stopping components...");
    components.stop().await;

    Ok(())
}
