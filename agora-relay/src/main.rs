use std::sync::Arc;

use agora_relay::backplane::{Backplane, LocalBackplane, RedisBackplane};
use agora_relay::presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore};
use agora_relay::server::BoxError;
use agora_relay::storage::{DurableLog, MemoryEventLog, RocksEventLog, StoreConfig};
use agora_relay::{Hub, RelayConfig, RelayServer};
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    info!("Starting agora-relay with {config:?}");

    let (presence, backplane): (Arc<dyn PresenceStore>, Arc<dyn Backplane>) =
        match &config.redis_url {
            Some(url) => (
                Arc::new(RedisPresenceStore::connect(url, config.presence_key.clone()).await?),
                Arc::new(RedisBackplane::connect(url).await?),
            ),
            None => {
                warn!("REDIS_ENDPOINT not set, running as a single process");
                (
                    Arc::new(MemoryPresenceStore::new()),
                    Arc::new(LocalBackplane::default()),
                )
            }
        };

    let log: Arc<dyn DurableLog> = match &config.storage_path {
        Some(path) => {
            let store = RocksEventLog::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!("Durable log at {} (sequence {})", path.display(), store.sequence());
            Arc::new(store)
        }
        None => {
            warn!("STORAGE_PATH not set, events are kept in memory only");
            Arc::new(MemoryEventLog::new())
        }
    };

    let hub = Hub::start(config.hub_config(), presence, log, backplane).await?;
    RelayServer::new(config, Arc::new(hub)).run().await
}
