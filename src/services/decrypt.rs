use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    models::{ActivityEvent, EncryptedRow, PostId},
    services::keys::ActivityPrivateKey,
};

/// Bounded pool for RSA decryption of stored activity records.
///
/// RSA-OAEP decryption is CPU-bound and a single feed request can need
/// hundreds of them, so each record is decrypted on the blocking thread
/// pool behind a semaphore sized to the machine's parallelism. The
/// semaphore keeps a burst of feed requests from flooding `spawn_blocking`
/// with thousands of queued decryptions.
#[derive(Clone)]
pub struct DecryptPool {
    permits: Arc<Semaphore>,
}

impl DecryptPool {
    /// `workers` overrides the permit count; by default one permit per
    /// available core.
    pub fn new(workers: Option<usize>) -> Self {
        let permits = workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        Self {
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    /// Decrypts a batch of stored records into scoreable events.
    ///
    /// Records that fail to decrypt or parse are dropped: a record sealed
    /// to a previous keypair generation is expected after re-registration
    /// and must not fail the whole read.
    pub async fn decrypt_batch(
        &self,
        key: &ActivityPrivateKey,
        rows: Vec<EncryptedRow>,
    ) -> Vec<ActivityEvent> {
        let total = rows.len();
        let mut handles = Vec::with_capacity(total);

        for row in rows {
            let permits = Arc::clone(&self.permits);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                // Closed only on shutdown; treat as a skipped record.
                let Ok(_permit) = permits.acquire_owned().await else {
                    return None;
                };
                tokio::task::spawn_blocking(move || decrypt_row(&key, &row))
                    .await
                    .ok()
                    .flatten()
            }));
        }

        let mut events = Vec::with_capacity(total);
        for handle in handles {
            if let Ok(Some(event)) = handle.await {
                events.push(event);
            }
        }

        if events.len() < total {
            debug!(
                dropped = total - events.len(),
                total, "skipped undecryptable activity records"
            );
        }
        events
    }
}

fn decrypt_row(key: &ActivityPrivateKey, row: &EncryptedRow) -> Option<ActivityEvent> {
    let metadata_bytes = key.open(&row.metadata)?;
    let metadata: Value = serde_json::from_slice(&metadata_bytes).ok()?;
    let post_id = PostId::from_metadata(metadata.as_object()?)?;

    let created_bytes = key.open(&row.created)?;
    let created_str = std::str::from_utf8(&created_bytes).ok()?;
    let created = DateTime::parse_from_rfc3339(created_str)
        .ok()?
        .with_timezone(&Utc);

    Some(ActivityEvent {
        post_id,
        metadata,
        event_count: row.event_count,
        rank: row.rank,
        created,
    })
}
