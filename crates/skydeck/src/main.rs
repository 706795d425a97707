// skydeck daemon: loads the instance configuration, wires the realtime
// layer together, and serves the browser stream endpoint.

mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use skydeck_api::AdapterClient;
use skydeck_config::{default_config_path, FileInstanceStore, KeyringCipher};
use skydeck_core::{ConnectionRegistry, TopicBroker};

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(default_config_path)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config_path();
    info!(path = %path.display(), "loading configuration");
    let store = Arc::new(FileInstanceStore::open(
        path,
        Arc::new(KeyringCipher::new("skydeck")),
    )?);

    let transport = store.transport_config();
    let listen = store.listen_addr();

    let broker = TopicBroker::new();
    let client = AdapterClient::new(&transport)?;
    let (registry, _reauth) = ConnectionRegistry::wire(
        store.clone(),
        Arc::new(broker.clone()),
        client,
        store, // per-instance supervisor tuning comes from the config file
    );

    let app = ws::router(broker, registry);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(%listen, "serving browser stream endpoint at /ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
