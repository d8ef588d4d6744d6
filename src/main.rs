use tigo_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let config = ConfigWrapper::new(&options.config_file).unwrap_or_else(|err| {
        tigo_bridge::init_logging("info");
        error!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });

    tigo_bridge::init_logging(config.loglevel());
    info!("using config file {}", options.config_file);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        shutdown_signal().await;
        if let Err(e) = shutdown_tx.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    tigo_bridge::app(shutdown_rx, config).await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = ctrl_c() => {}
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        // without a handler there is no way to stop gracefully; wait forever
        std::future::pending::<()>().await;
    }
}
