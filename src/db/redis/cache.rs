use redis::AsyncCommands;
use redis::Client;
use std::fmt::Display;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::error::AppResult;

use crate::models::ActivityType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Global per-user average event count for one post. Keyed per
    /// requesting user (prefix of the anonymous id) because the aggregate
    /// excludes the requester's own events.
    GlobalAverage {
        activity: ActivityType,
        post: String,
        user_tag: String,
    },
    /// Chain account lookup (memo key), by username.
    ChainAccount(String),
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::GlobalAverage {
                activity,
                post,
                user_tag,
            } => write!(f, "gavg:{}:{}:{}", activity, user_tag, post),
            CacheKey::ChainAccount(username) => write!(f, "account:{}", username.to_lowercase()),
        }
    }
}

/// Creates a Redis client for caching
///
/// No connection is made until the first command, so this is safe to call
/// without a reachable Redis instance.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Message for asynchronous cache writes
struct CacheWriteMessage {
    key: String,
    value: String,
    ttl: u64,
}

/// Cache handler for storing and retrieving data from Redis
#[derive(Clone)]
pub struct Cache {
    redis_client: Client,
    write_tx: mpsc::UnboundedSender<CacheWriteMessage>,
}

/// Handle for gracefully shutting down the cache writer
pub struct CacheWriterHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl CacheWriterHandle {
    /// Signals the writer task to flush pending writes and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Cache writer shutdown signal sent");
    }
}

impl Cache {
    /// Creates a new Cache instance with an async write background task
    ///
    /// Writes are handed to a background task so cache population never
    /// blocks a request. The returned handle must be kept alive for the
    /// lifetime of the process.
    pub async fn new(redis_client: Client) -> (Self, CacheWriterHandle) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let client = redis_client.clone();
        tokio::spawn(async move {
            Self::cache_writer_task(client, write_rx, shutdown_rx).await;
        });

        let cache = Self {
            redis_client,
            write_tx,
        };

        let handle = CacheWriterHandle { shutdown_tx };

        (cache, handle)
    }

    /// Background task that processes cache write messages
    async fn cache_writer_task(
        client: Client,
        mut write_rx: mpsc::UnboundedReceiver<CacheWriteMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::debug!("Cache writer task started");

        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    if let Err(e) = Self::write_to_redis(&client, msg).await {
                        tracing::error!(error = %e, "Failed to write to Redis cache");
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Flush whatever is still queued before exiting.
                    while let Ok(msg) = write_rx.try_recv() {
                        if let Err(e) = Self::write_to_redis(&client, msg).await {
                            tracing::error!(error = %e, "Failed to flush cache write during shutdown");
                        }
                    }

                    tracing::debug!("Cache writer task stopped");
                    break;
                }
            }
        }
    }

    /// Writes a single message to Redis
    async fn write_to_redis(client: &Client, msg: CacheWriteMessage) -> AppResult<()> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = conn.set_ex(msg.key, msg.value, msg.ttl).await?;
        Ok(())
    }

    /// Retrieves a value from the cache by key
    ///
    /// Returns `None` on a cache miss; deserialization failures surface as
    /// internal errors.
    pub async fn get_from_cache<T: serde::de::DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> AppResult<Option<T>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let cached: Option<String> = conn.get(format!("{}", key)).await?;

        match cached {
            Some(json) => {
                let data = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Cache deserialization error: {}", e))
                })?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Stores a value in the cache asynchronously without blocking
    ///
    /// The value is serialized and handed to the background writer; this
    /// method returns immediately and never reports write failures.
    pub fn set_in_background<T: serde::Serialize>(&self, key: &CacheKey, value: &T, ttl: u64) {
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Cache serialization error");
                return;
            }
        };

        let msg = CacheWriteMessage {
            key: format!("{}", key),
            value: json,
            ttl,
        };

        if let Err(e) = self.write_tx.send(msg) {
            tracing::error!(error = %e, "Failed to send cache write message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_display_global_average() {
        let key = CacheKey::GlobalAverage {
            activity: ActivityType::PostScrolled,
            post: "alice/hello-world".to_string(),
            user_tag: "a1b2c3d4".to_string(),
        };
        assert_eq!(
            format!("{}", key),
            "gavg:post_scrolled:a1b2c3d4:alice/hello-world"
        );
    }

    #[test]
    fn test_cache_key_display_chain_account() {
        let key = CacheKey::ChainAccount("Alice".to_string());
        assert_eq!(format!("{}", key), "account:alice");
    }
}
