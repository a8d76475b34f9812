use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::{
    db::{ActivityStore, Cache, CacheKey},
    error::{AppError, AppResult},
    models::{ActivityType, PostAverage, PostId},
    services::{
        decrypt::DecryptPool,
        keys::{seal, sha256_hex, ActivityPrivateKey},
        providers::SearchBackend,
        scoring::{interest_score, AUTHORED_SCORE, UPVOTED_SCORE},
    },
};

const GLOBAL_AVERAGE_TTL: u64 = 600; // 10 minutes
const SERVED_SCAN_CHUNK: i64 = 64;

/// Anonymous aggregate identity for one user.
///
/// Derived from the username, the activity public key and the secret
/// user id, so the aggregate rows cannot be joined back to the account
/// without the id the user alone holds.
pub fn anonymous_user_id(username: &str, public_activity_key: &str, user_id: &str) -> String {
    sha256_hex(&format!("{username}{public_activity_key}{user_id}"))
}

/// Scored per-user activity, plus the personal baseline the scores were
/// computed against.
#[derive(Debug, Clone)]
pub struct ScoredActivity {
    pub posts: Vec<(PostId, f64)>,
    pub personal_average: f64,
}

/// The activity ledger: dual writes on record, decrypt-and-score on read.
///
/// Every recorded event lands twice. The anonymized aggregate insert runs
/// first and doubles as the dedup gate; only when it actually creates a
/// row does the per-user encrypted record get appended. Reads decrypt the
/// per-user records and score each post against the global and personal
/// engagement baselines.
#[derive(Clone)]
pub struct ActivityLedger {
    store: Arc<dyn ActivityStore>,
    search: Arc<dyn SearchBackend>,
    decrypt: DecryptPool,
    cache: Cache,
}

impl ActivityLedger {
    pub fn new(
        store: Arc<dyn ActivityStore>,
        search: Arc<dyn SearchBackend>,
        decrypt: DecryptPool,
        cache: Cache,
    ) -> Self {
        Self {
            store,
            search,
            decrypt,
            cache,
        }
    }

    /// Records one activity event. Returns whether a new aggregate row was
    /// created; a duplicate inside the dedup window writes nothing at all.
    pub async fn record(
        &self,
        activity: ActivityType,
        username: &str,
        user_id: &str,
        public_activity_key: &str,
        metadata: &Map<String, Value>,
    ) -> AppResult<bool> {
        let filtered = filter_metadata(activity, metadata)?;
        // Map serialization is key-ordered, so equal metadata always
        // produces byte-equal text and dedup matching stays exact.
        let metadata_json = serde_json::to_string(&Value::Object(filtered))
            .map_err(|e| AppError::Internal(format!("metadata encoding failed: {e}")))?;

        let anonymous_id = anonymous_user_id(username, public_activity_key, user_id);
        let now = Utc::now();
        let window_start = now - activity.dedup_delay();

        let created = self
            .store
            .insert_aggregate(activity, &anonymous_id, &metadata_json, now, window_start)
            .await?;
        if !created {
            debug!(%activity, "duplicate activity inside dedup window, skipped");
            return Ok(false);
        }

        let metadata_id = sha256_hex(&format!(
            "{metadata_json}{user_id}{public_activity_key}{username}"
        ));
        let metadata_ciphertext = seal(public_activity_key, metadata_json.as_bytes())?;
        let created_ciphertext = seal(public_activity_key, now.to_rfc3339().as_bytes())?;

        self.store
            .append_user_record(
                activity,
                username,
                &metadata_id,
                &metadata_ciphertext,
                &created_ciphertext,
            )
            .await?;

        Ok(true)
    }

    /// Decrypts up to `limit` of the user's most recent records for one
    /// activity type and scores each distinct post.
    ///
    /// Zero-scored posts are dropped. When `allow_filling` is set and
    /// fewer than `min_results` posts survive, the result is padded with
    /// the user's own recent posts and strong up-votes at fixed scores.
    pub async fn read_scored(
        &self,
        activity: ActivityType,
        username: &str,
        anonymous_user_id: &str,
        key: &ActivityPrivateKey,
        limit: i64,
        min_results: usize,
        allow_filling: bool,
    ) -> AppResult<ScoredActivity> {
        let rows = self
            .store
            .grouped_user_events(activity, username, limit)
            .await?;
        let events = self.decrypt.decrypt_batch(key, rows).await;

        let personal = self.store.personal_average(activity, username).await?;

        // One global-average lookup per distinct post, fanned out; the
        // cache is best effort and a Redis outage degrades to store reads.
        let mut handles = Vec::with_capacity(events.len());
        for event in events {
            let store = Arc::clone(&self.store);
            let cache = self.cache.clone();
            let anonymous_id = anonymous_user_id.to_string();
            handles.push(tokio::spawn(async move {
                let metadata_json = serde_json::to_string(&event.metadata)
                    .map_err(|e| AppError::Internal(format!("metadata encoding failed: {e}")))?;
                let global = cached_global_average(
                    &store,
                    &cache,
                    activity,
                    &event.post_id,
                    &metadata_json,
                    &anonymous_id,
                )
                .await?;
                Ok::<_, AppError>((event, global))
            }));
        }

        let mut posts: Vec<(PostId, f64)> = Vec::new();
        let mut present: HashSet<PostId> = HashSet::new();
        for handle in handles {
            let (event, global) = handle
                .await
                .map_err(|e| AppError::Internal(format!("scoring task failed: {e}")))??;
            let score = interest_score(event.event_count as f64, global.avg, personal.avg);
            if score > 0.0 && present.insert(event.post_id.clone()) {
                posts.push((event.post_id, score));
            }
        }

        if allow_filling && posts.len() < min_results {
            self.fill_from_profile(username, min_results, &mut posts, &mut present)
                .await?;
        }

        Ok(ScoredActivity {
            posts,
            personal_average: personal.avg,
        })
    }

    /// Posts recommended to the user since `cutoff`, scanned newest first
    /// with early exit: ranks are append-at-zero, so the first record
    /// older than the cutoff ends the scan. At most `limit` records are
    /// read regardless of how far back the cutoff reaches.
    pub async fn recently_served(
        &self,
        username: &str,
        key: &ActivityPrivateKey,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<PostId>> {
        let activity = ActivityType::PostRecommended;
        let mut served = Vec::new();
        let mut offset = 0_i64;

        while offset < limit {
            let chunk_size = SERVED_SCAN_CHUNK.min(limit - offset);
            let rows = self
                .store
                .user_records_by_rank(activity, username, offset, chunk_size)
                .await?;
            let exhausted = (rows.len() as i64) < chunk_size;
            let row_count = rows.len();

            let events = self.decrypt.decrypt_batch(key, rows).await;
            // A chunk where nothing decrypts belongs to a previous keypair
            // generation; everything below it is older still.
            let mut past_cutoff = row_count > 0 && events.is_empty();
            for event in events {
                if event.created >= cutoff {
                    served.push(event.post_id);
                } else {
                    past_cutoff = true;
                }
            }

            if exhausted || past_cutoff {
                break;
            }
            offset += chunk_size;
        }

        Ok(served)
    }

    async fn fill_from_profile(
        &self,
        username: &str,
        min_results: usize,
        posts: &mut Vec<(PostId, f64)>,
        present: &mut HashSet<PostId>,
    ) -> AppResult<()> {
        let missing = min_results - posts.len();
        let authored = self.search.latest_authored(username, missing).await?;
        for post_id in authored {
            if present.insert(post_id.clone()) {
                posts.push((post_id, AUTHORED_SCORE));
            }
        }

        if posts.len() < min_results {
            let missing = min_results - posts.len();
            let upvoted = self.search.latest_upvoted(username, missing).await?;
            for post_id in upvoted {
                if present.insert(post_id.clone()) {
                    posts.push((post_id, UPVOTED_SCORE));
                }
            }
        }

        debug!(
            username,
            filled = posts.len(),
            "padded sparse activity from profile"
        );
        Ok(())
    }
}

fn filter_metadata(
    activity: ActivityType,
    metadata: &Map<String, Value>,
) -> AppResult<Map<String, Value>> {
    let mut filtered = Map::new();
    for &field in activity.spec().required_metadata {
        let value = metadata.get(field).ok_or_else(|| {
            AppError::Validation(format!("missing metadata field: {field}"))
        })?;
        filtered.insert(field.to_string(), value.clone());
    }
    Ok(filtered)
}

/// Global average for one post, read through the cache. Cache failures
/// count as misses; only the store itself can fail the read.
async fn cached_global_average(
    store: &Arc<dyn ActivityStore>,
    cache: &Cache,
    activity: ActivityType,
    post_id: &PostId,
    metadata_json: &str,
    anonymous_user_id: &str,
) -> AppResult<PostAverage> {
    let user_tag = anonymous_user_id.chars().take(8).collect::<String>();
    let cache_key = CacheKey::GlobalAverage {
        activity,
        post: post_id.to_string(),
        user_tag,
    };

    if let Some(cached) = cache
        .get_from_cache::<PostAverage>(&cache_key)
        .await
        .ok()
        .flatten()
    {
        return Ok(cached);
    }

    let global = store
        .global_average(activity, metadata_json, anonymous_user_id)
        .await?;
    cache.set_in_background(&cache_key, &global, GLOBAL_AVERAGE_TTL);
    Ok(global)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::activity_store::MockActivityStore;
    use crate::models::{EncryptedRow, PersonalAverage};
    use crate::services::keys::{generate_activity_keypair, ActivityKeypair};
    use crate::services::providers::MockSearchBackend;
    use serde_json::json;

    async fn test_cache() -> Cache {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let (cache, handle) = Cache::new(client).await;
        // Writer errors are logged and ignored; leak the handle for the
        // duration of the test.
        std::mem::forget(handle);
        cache
    }

    fn ledger(store: MockActivityStore, search: MockSearchBackend, cache: Cache) -> ActivityLedger {
        ActivityLedger::new(
            Arc::new(store),
            Arc::new(search),
            DecryptPool::new(Some(2)),
            cache,
        )
    }

    fn sealed_row(
        keypair: &ActivityKeypair,
        author: &str,
        count: i64,
        rank: i64,
        created: &str,
    ) -> EncryptedRow {
        let metadata = json!({"author": author, "permlink": "p"}).to_string();
        EncryptedRow {
            metadata_id: format!("id-{author}-{rank}"),
            metadata: seal(&keypair.public_pem, metadata.as_bytes()).unwrap(),
            created: seal(&keypair.public_pem, created.as_bytes()).unwrap(),
            event_count: count,
            rank,
        }
    }

    #[tokio::test]
    async fn test_record_rejects_incomplete_metadata() {
        let cache = test_cache().await;
        let ledger = ledger(MockActivityStore::new(), MockSearchBackend::new(), cache);

        let metadata = json!({"author": "alice"}).as_object().unwrap().clone();
        let err = ledger
            .record(
                ActivityType::PostOpened,
                "alice",
                "uid",
                "PUBPEM",
                &metadata,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_event_skips_user_write() {
        let mut store = MockActivityStore::new();
        store
            .expect_insert_aggregate()
            .returning(|_, _, _, _, _| Ok(false));
        store.expect_append_user_record().never();

        let cache = test_cache().await;
        let ledger = ledger(store, MockSearchBackend::new(), cache);

        let metadata = json!({"author": "alice", "permlink": "p"})
            .as_object()
            .unwrap()
            .clone();
        let created = ledger
            .record(
                ActivityType::PostScrolled,
                "alice",
                "uid",
                "PUBPEM",
                &metadata,
            )
            .await
            .unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn test_record_writes_both_collections() {
        let keypair = generate_activity_keypair().unwrap();
        let public_pem = keypair.public_pem.clone();

        // Stripped-to-required, key-ordered metadata text.
        let metadata_json = r#"{"author":"alice","permlink":"p"}"#;
        let expected_anonymous = anonymous_user_id("alice", &public_pem, "uid");
        let expected_metadata_id = sha256_hex(&format!(
            "{metadata_json}uid{public_pem}alice"
        ));

        let mut store = MockActivityStore::new();
        {
            let expected_anonymous = expected_anonymous.clone();
            store
                .expect_insert_aggregate()
                .withf(move |activity, anon, metadata, _, _| {
                    *activity == ActivityType::PostScrolled
                        && anon == expected_anonymous
                        && metadata == r#"{"author":"alice","permlink":"p"}"#
                })
                .returning(|_, _, _, _, _| Ok(true));
        }
        store
            .expect_append_user_record()
            .withf(move |_, username, metadata_id, _, _| {
                username == "alice" && metadata_id == expected_metadata_id
            })
            .returning(|_, _, _, _, _| Ok(()));

        let cache = test_cache().await;
        let ledger = ledger(store, MockSearchBackend::new(), cache);

        // Extra fields are stripped before hashing and storage.
        let metadata = json!({
            "permlink": "p",
            "author": "alice",
            "scroll_depth": 0.8
        })
        .as_object()
        .unwrap()
        .clone();

        let created = ledger
            .record(
                ActivityType::PostScrolled,
                "alice",
                "uid",
                &keypair.public_pem,
                &metadata,
            )
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_read_scored_drops_zero_scores() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let rows = vec![
            sealed_row(&keypair, "alice", 3, 0, "2026-08-20T12:00:00Z"),
            sealed_row(&keypair, "bob", 2, 1, "2026-08-20T11:00:00Z"),
        ];

        let mut store = MockActivityStore::new();
        store
            .expect_grouped_user_events()
            .returning(move |_, _, _| Ok(rows.clone()));
        store.expect_personal_average().returning(|_, _| {
            Ok(PersonalAverage {
                avg: 0.0,
                posts: 0,
                total: 0,
            })
        });
        store
            .expect_global_average()
            .returning(|_, metadata, _| {
                // Only alice's post has any cross-user engagement.
                let avg = if metadata.contains("alice") { 1.5 } else { 0.0 };
                Ok(PostAverage {
                    avg,
                    users: 2,
                    total: 3,
                })
            });

        let cache = test_cache().await;
        let ledger = ledger(store, MockSearchBackend::new(), cache);

        let scored = ledger
            .read_scored(
                ActivityType::PostScrolled,
                "carol",
                "anon-carol",
                &key,
                250,
                0,
                false,
            )
            .await
            .unwrap();

        assert_eq!(scored.posts.len(), 1);
        assert_eq!(scored.posts[0].0.as_str(), "alice/p");
        assert!((scored.posts[0].1 - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_sparse_activity_fills_from_profile() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let mut store = MockActivityStore::new();
        store
            .expect_grouped_user_events()
            .returning(|_, _, _| Ok(Vec::new()));
        store
            .expect_personal_average()
            .returning(|_, _| Ok(PersonalAverage::default()));

        let mut search = MockSearchBackend::new();
        search.expect_latest_authored().returning(|_, _| {
            Ok(vec![
                PostId::new("carol", "mine-1"),
                PostId::new("carol", "mine-2"),
            ])
        });
        search.expect_latest_upvoted().returning(|_, _| {
            // One duplicate of an authored post, one fresh.
            Ok(vec![
                PostId::new("carol", "mine-1"),
                PostId::new("dave", "voted"),
            ])
        });

        let cache = test_cache().await;
        let ledger = ledger(store, search, cache);

        let scored = ledger
            .read_scored(
                ActivityType::PostScrolled,
                "carol",
                "anon-carol",
                &key,
                250,
                3,
                true,
            )
            .await
            .unwrap();

        assert_eq!(scored.posts.len(), 3);
        assert_eq!(scored.posts[0].1, AUTHORED_SCORE);
        assert_eq!(scored.posts[1].1, AUTHORED_SCORE);
        assert_eq!(scored.posts[2].0.as_str(), "dave/voted");
        assert_eq!(scored.posts[2].1, UPVOTED_SCORE);
    }

    #[tokio::test]
    async fn test_recently_served_stops_at_cutoff() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let chunk: Vec<EncryptedRow> = (0..SERVED_SCAN_CHUNK)
            .map(|rank| {
                let created = if rank < 2 {
                    "2026-08-23T12:00:00Z"
                } else {
                    "2026-08-01T12:00:00Z"
                };
                sealed_row(&keypair, &format!("a{rank}"), 1, rank, created)
            })
            .collect();

        let mut store = MockActivityStore::new();
        store
            .expect_user_records_by_rank()
            .withf(|_, _, offset, _| *offset == 0)
            .times(1)
            .returning(move |_, _, _, _| Ok(chunk.clone()));

        let cache = test_cache().await;
        let ledger = ledger(store, MockSearchBackend::new(), cache);

        let cutoff = DateTime::parse_from_rfc3339("2026-08-17T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let served = ledger
            .recently_served("carol", &key, cutoff, 1000)
            .await
            .unwrap();

        assert_eq!(served.len(), 2);
    }

    #[tokio::test]
    async fn test_recently_served_caps_total_records_scanned() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        // Every record is fresh, so only the scan limit can end the loop.
        let chunk: Vec<EncryptedRow> = (0..SERVED_SCAN_CHUNK)
            .map(|rank| sealed_row(&keypair, &format!("a{rank}"), 1, rank, "2026-08-23T12:00:00Z"))
            .collect();

        let limit = 2 * SERVED_SCAN_CHUNK;
        let mut store = MockActivityStore::new();
        store
            .expect_user_records_by_rank()
            .withf(move |_, _, offset, chunk_size| {
                *offset < limit && *chunk_size == SERVED_SCAN_CHUNK
            })
            .times(2)
            .returning(move |_, _, _, _| Ok(chunk.clone()));

        let cache = test_cache().await;
        let ledger = ledger(store, MockSearchBackend::new(), cache);

        let cutoff = DateTime::parse_from_rfc3339("2026-08-17T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let served = ledger
            .recently_served("carol", &key, cutoff, limit)
            .await
            .unwrap();

        assert_eq!(served.len(), limit as usize);
    }
}
