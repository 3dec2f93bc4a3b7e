use std::sync::Arc;

use quill_collab::{CollabServer, DistributedLog, MemoryLog, NatsLog, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting Quill collab relay (category {}, bind {})",
        config.category,
        config.bind_addr
    );

    let backend: Arc<dyn DistributedLog> = match &config.log_url {
        Some(url) => match NatsLog::connect(url).await {
            Ok(nats) => Arc::new(nats),
            Err(e) => {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        },
        None => {
            log::warn!("QUILL_LOG_URL is not set, rooms replicate only inside this process");
            Arc::new(MemoryLog::new())
        }
    };

    let server = CollabServer::new(config, backend);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
