use crate::config::Settings;
use crate::ort_service::{probe_device, OrtUpscaler};
use crate::server::HttpServer;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Settings) -> Result<(), Box<dyn Error>> {
    let device = probe_device();
    let upscaler = match OrtUpscaler::new(&config.model, device) {
        Ok(upscaler) => Arc::new(upscaler),
        Err(e) => {
            tracing::error!("Failed to initialize upscaler: {:?}", e);
            return Err(e.into());
        }
    };

    let server = HttpServer::new(upscaler, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
