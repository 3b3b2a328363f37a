//! Asynchronous delivery queue.
//!
//! Publishing to the channel hub only reaches sockets on this instance.
//! Every successful dispatcher handler also enqueues a delivery job here;
//! a worker on each instance consumes the stream and pushes the payload to
//! whichever recipients are connected locally. A recipient connected
//! nowhere is not a failure — persisted state already holds the message.
//!
//! Backed by a Redis stream when configured (every instance reads every
//! job), or an in-process broadcast bus for single-instance deployments
//! and tests. Delivery is at-least-once; clients deduplicate by message id.

use axum::extract::ws::Message;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

use crate::error::ChatResult;
use crate::registry::ConnectionRegistry;

/// Stream the producers append to and every worker reads.
pub const STREAM_KEY: &str = "chat:delivery";

const DELIVERY_ATTEMPTS: u32 = 3;
const DELIVERY_BACKOFF_MS: u64 = 1000;
const READ_BLOCK_MS: usize = 5000;
const READ_BATCH: usize = 32;
const MEMORY_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub to: Vec<String>,
    pub kind: String,
    pub conversation: String,
    pub data: serde_json::Value,
}

impl DeliveryJob {
    pub fn new(to: Vec<String>, conversation: &str, data: serde_json::Value) -> Self {
        Self {
            to,
            kind: "worker".to_string(),
            conversation: conversation.to_string(),
            data,
        }
    }
}

#[derive(Clone)]
pub enum JobQueue {
    Redis {
        client: redis::Client,
        conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
    },
    Memory {
        bus: broadcast::Sender<DeliveryJob>,
    },
}

impl JobQueue {
    /// In-process bus: jobs reach every worker spawned from this queue.
    pub fn in_memory() -> Self {
        let (bus, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        JobQueue::Memory { bus }
    }

    pub async fn connect(url: &str) -> ChatResult<Self> {
        let client = redis::Client::open(url)
            .map_err(crate::error::ChatError::from)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(JobQueue::Redis {
            client,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Producer side: append one job.
    pub async fn enqueue(&self, job: &DeliveryJob) -> ChatResult<()> {
        match self {
            JobQueue::Redis { conn, .. } => {
                let payload = serde_json::to_string(job)?;
                let mut conn = conn.lock().await;
                redis::cmd("XADD")
                    .arg(STREAM_KEY)
                    .arg("*")
                    .arg("job")
                    .arg(payload)
                    .query_async::<_, String>(&mut *conn)
                    .await?;
            }
            JobQueue::Memory { bus } => {
                // No worker subscribed yet means nothing to deliver to.
                let _ = bus.send(job.clone());
            }
        }
        Ok(())
    }

    /// Consumer side. Subscribes at call time so no job enqueued after
    /// this point is missed by the returned worker.
    pub fn worker(&self) -> DeliveryWorker {
        match self {
            JobQueue::Redis { client, .. } => DeliveryWorker {
                source: WorkerSource::Redis(client.clone()),
            },
            JobQueue::Memory { bus } => DeliveryWorker {
                source: WorkerSource::Memory(bus.subscribe()),
            },
        }
    }
}

enum WorkerSource {
    Redis(redis::Client),
    Memory(broadcast::Receiver<DeliveryJob>),
}

pub struct DeliveryWorker {
    source: WorkerSource,
}

impl DeliveryWorker {
    /// Long-running consumer loop. One per instance.
    pub async fn run(self, registry: Arc<ConnectionRegistry>) {
        match self.source {
            WorkerSource::Memory(mut rx) => loop {
                match rx.recv().await {
                    Ok(job) => deliver(&job, &registry).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "delivery worker lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            },
            WorkerSource::Redis(client) => run_redis_worker(client, registry).await,
        }
    }
}

async fn run_redis_worker(client: redis::Client, registry: Arc<ConnectionRegistry>) {
    let mut conn = loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => break conn,
            Err(err) => {
                error!(%err, "delivery worker cannot reach redis, retrying");
                tokio::time::sleep(Duration::from_millis(DELIVERY_BACKOFF_MS)).await;
            }
        }
    };

    // Start at the stream head: history is served by the message page
    // endpoint, the worker only forwards live traffic.
    let mut last_id = "$".to_string();
    loop {
        let options = StreamReadOptions::default()
            .block(READ_BLOCK_MS)
            .count(READ_BATCH);
        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[STREAM_KEY], &[last_id.as_str()], &options)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                error!(%err, "delivery stream read failed");
                tokio::time::sleep(Duration::from_millis(DELIVERY_BACKOFF_MS)).await;
                continue;
            }
        };

        let Some(reply) = reply else { continue };
        for key in reply.keys {
            for entry in key.ids {
                last_id = entry.id.clone();
                let Some(value) = entry.map.get("job") else {
                    warn!(id = %entry.id, "delivery entry without a job field");
                    continue;
                };
                let raw: String = match redis::from_redis_value(value) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(%err, id = %entry.id, "unreadable delivery entry dropped");
                        continue;
                    }
                };
                match serde_json::from_str::<DeliveryJob>(&raw) {
                    Ok(job) => deliver(&job, &registry).await,
                    Err(err) => warn!(%err, id = %entry.id, "malformed delivery job dropped"),
                }
            }
        }
    }
}

/// Push a job's payload to every locally connected recipient. Send
/// failures retry with backoff, then log and drop — no poison pill.
async fn deliver(job: &DeliveryJob, registry: &ConnectionRegistry) {
    let payload = match serde_json::to_string(&job.data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%err, conversation = %job.conversation, "undeliverable job payload");
            return;
        }
    };

    for recipient in &job.to {
        let handles = registry.get(recipient).await;
        if handles.is_empty() {
            debug!(%recipient, conversation = %job.conversation, "recipient not on this instance");
            continue;
        }
        for handle in handles {
            let mut attempt = 0;
            while !handle.send(Message::Text(payload.clone())) {
                attempt += 1;
                if attempt >= DELIVERY_ATTEMPTS {
                    warn!(
                        %recipient,
                        connection = handle.id,
                        "delivery retries exhausted, dropping"
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(DELIVERY_BACKOFF_MS)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn connect_user(
        registry: &ConnectionRegistry,
    ) -> (ConnectionHandle, broadcast::Receiver<Message>) {
        let (tx, rx) = broadcast::channel(8);
        (
            ConnectionHandle {
                id: registry.next_id(),
                sender: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn delivers_to_locally_connected_recipients() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, mut rx) = connect_user(&registry);
        registry.add("aa11", handle).await;

        let queue = JobQueue::in_memory();
        let worker = queue.worker();
        tokio::spawn(worker.run(registry.clone()));

        let job = DeliveryJob::new(
            vec!["aa11".into(), "zz99".into()],
            "c1",
            json!({"kind": "new", "message": {"_id": "m1"}}),
        );
        queue.enqueue(&job).await.unwrap();

        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["kind"], "new");
                assert_eq!(value["message"]["_id"], "m1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_worker_observes_every_job() {
        // Two workers with separate registries stand in for two instances.
        let registry_a = Arc::new(ConnectionRegistry::new());
        let registry_b = Arc::new(ConnectionRegistry::new());
        let (handle_a, mut rx_a) = connect_user(&registry_a);
        let (handle_b, mut rx_b) = connect_user(&registry_b);
        registry_a.add("aa11", handle_a).await;
        registry_b.add("bb22", handle_b).await;

        let queue = JobQueue::in_memory();
        let worker_a = queue.worker();
        let worker_b = queue.worker();
        tokio::spawn(worker_a.run(registry_a.clone()));
        tokio::spawn(worker_b.run(registry_b.clone()));

        let job = DeliveryJob::new(
            vec!["aa11".into(), "bb22".into()],
            "c1",
            json!({"kind": "new", "message": {"_id": "m1"}}),
        );
        queue.enqueue(&job).await.unwrap();

        assert!(timeout(Duration::from_secs(2), rx_a.recv()).await.is_ok());
        assert!(timeout(Duration::from_secs(2), rx_b.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn absent_recipient_completes_without_error() {
        let registry = Arc::new(ConnectionRegistry::new());
        let queue = JobQueue::in_memory();
        let worker = queue.worker();
        tokio::spawn(worker.run(registry.clone()));

        let job = DeliveryJob::new(vec!["nobody".into()], "c1", json!({"kind": "new"}));
        queue.enqueue(&job).await.unwrap();

        // Give the worker a beat; nothing to assert beyond no panic.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn job_wire_shape() {
        let job = DeliveryJob::new(vec!["aa11".into()], "c1", json!({"kind": "new"}));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], "worker");
        assert_eq!(value["conversation"], "c1");
        assert_eq!(value["to"][0], "aa11");
        assert_eq!(value["data"]["kind"], "new");
    }
}
