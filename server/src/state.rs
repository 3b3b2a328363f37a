//! Shared application state.

use anyhow::Result;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::db::Database;
use crate::hub::ChannelHub;
use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: ChannelHub,
    pub queue: JobQueue,
    pub limiter: RateLimiter,
    start_time: u64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let queue = match &config.redis_uri {
            Some(uri) => JobQueue::connect(uri).await?,
            None => JobQueue::in_memory(),
        };
        Self::with_queue(config, queue).await
    }

    /// Build state around an existing queue. Lets tests share one bus
    /// between several instances.
    pub async fn with_queue(config: Config, queue: JobQueue) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        Ok(Self {
            config,
            db,
            registry: Arc::new(ConnectionRegistry::new()),
            hub: ChannelHub::new(),
            queue,
            limiter: RateLimiter::new(),
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        })
    }

    /// Spawn this instance's delivery worker.
    pub fn spawn_worker(self: &Arc<Self>) {
        let worker = self.queue.worker();
        let registry = self.registry.clone();
        tokio::spawn(worker.run(registry));
    }

    pub fn uptime(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_sub(self.start_time)
    }
}
