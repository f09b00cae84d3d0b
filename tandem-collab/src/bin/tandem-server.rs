use std::sync::Arc;
use tandem_collab::{MemoryStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting tandem server on {} (max {} participants per session)",
        config.bind_addr,
        config.max_participants
    );

    let server = SyncServer::with_store(config, Arc::new(MemoryStore::new()));
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down: {} connections served, {} operations applied",
                stats.total_connections,
                stats.operations_applied
            );
        }
    }
}
