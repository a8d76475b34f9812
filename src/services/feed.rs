use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{AppError, AppResult},
    models::{AuthorPermlink, DocumentVectors, FeedFilter, PostId, IMAGE_SPACE},
    services::{
        keys::ActivityPrivateKey,
        ledger::ActivityLedger,
        providers::{SearchBackend, SimilarityFilter},
        sampler,
        similar::SimilarityAggregator,
    },
};

/// How many scored posts are sampled as expansion seeds.
const SAMPLE_SIZE: usize = 35;
/// Neighbours fetched per query vector; raised under content filters so
/// enough candidates survive the narrower pool.
const K_DEFAULT: usize = 12;
const K_FILTERED: usize = 50;
/// Floor on scored posts before profile filling kicks in.
const MIN_RESULTS_DEFAULT: usize = 30;
const MIN_RESULTS_FILTERED: usize = 150;
/// Most recent activity records considered per request.
const ACTIVITY_LIMIT: i64 = 1000;
/// Posts recommended within this window are excluded from candidates.
const SERVED_LOOKBACK_DAYS: i64 = 7;
/// Hard cap on served-history records scanned per request.
const SERVED_SCAN_LIMIT: i64 = 1000;

/// Assembles a personalized feed: score the user's activity, sample seeds,
/// expand to similar posts, and sample the final page by weight.
#[derive(Clone)]
pub struct FeedAssembler {
    ledger: ActivityLedger,
    similar: SimilarityAggregator,
    search: Arc<dyn SearchBackend>,
}

impl FeedAssembler {
    pub fn new(
        ledger: ActivityLedger,
        similar: SimilarityAggregator,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            ledger,
            similar,
            search,
        }
    }

    pub async fn build_feed(
        &self,
        username: &str,
        anonymous_user_id: &str,
        key: &ActivityPrivateKey,
        amount: usize,
        filter: &FeedFilter,
    ) -> AppResult<Vec<AuthorPermlink>> {
        let filtered = !filter.is_empty();
        let (k, min_results) = if filtered {
            (K_FILTERED, MIN_RESULTS_FILTERED)
        } else {
            (K_DEFAULT, MIN_RESULTS_DEFAULT)
        };

        // The served-posts scan only depends on the ledger; run it while
        // the activity is being scored.
        let served_task = {
            let ledger = self.ledger.clone();
            let username = username.to_string();
            let key = key.clone();
            let cutoff = Utc::now() - Duration::days(SERVED_LOOKBACK_DAYS);
            tokio::spawn(async move {
                ledger
                    .recently_served(&username, &key, cutoff, SERVED_SCAN_LIMIT)
                    .await
            })
        };

        let scored = self
            .ledger
            .read_scored(
                crate::models::ActivityType::PostScrolled,
                username,
                anonymous_user_id,
                key,
                ACTIVITY_LIMIT,
                min_results,
                true,
            )
            .instrument(info_span!("score_activity", username))
            .await?;
        debug!(username, scored = scored.posts.len(), "activity scored");

        let sample = {
            let mut rng = rand::thread_rng();
            sampler::pick(&mut rng, &scored.posts, Some(SAMPLE_SIZE))
        };

        let mut sample_vectors = self
            .search
            .post_vectors(&sample)
            .instrument(info_span!("fetch_sample_vectors", sampled = sample.len()))
            .await?;
        if !filter.langs.is_empty() {
            filter_spaces(&mut sample_vectors, &filter.langs);
        }

        let served = served_task
            .await
            .map_err(|e| AppError::Internal(format!("served-posts task failed: {e}")))??;
        debug!(username, served = served.len(), "recently served posts excluded");

        // Every scored post is excluded from expansion, not just the
        // sampled seeds; a scored post the sample skipped must not come
        // back as a fresh candidate.
        let mut exclude_ids: Vec<PostId> =
            scored.posts.iter().map(|(id, _)| id.clone()).collect();
        exclude_ids.extend(served);
        let similarity_filter = SimilarityFilter {
            exclude_author: Some(username.to_string()),
            exclude_ids,
            tags: filter.tags.clone(),
            parent_permlinks: filter.parent_permlinks.clone(),
        };

        // A degraded feed beats a failed request when the index is having
        // a bad moment; the client retries on its next page anyway.
        let expansion = self
            .similar
            .expand(&sample_vectors, k, &similarity_filter)
            .instrument(info_span!("expand_candidates", k));
        let candidates = match expansion.await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(username, error = %e, "similarity expansion failed, serving empty feed");
                return Ok(Vec::new());
            }
        };
        debug!(username, candidates = candidates.len(), "expansion complete");

        let page = {
            let mut rng = rand::thread_rng();
            sampler::pick(&mut rng, &candidates, Some(amount))
        };

        self.search
            .resolve_posts(&page)
            .instrument(info_span!("resolve_page", picked = page.len()))
            .await
    }
}

/// Keeps only the requested language spaces; the image space always
/// survives because image similarity is language independent.
fn filter_spaces(vectors: &mut HashMap<PostId, DocumentVectors>, langs: &[String]) {
    for spaces in vectors.values_mut() {
        spaces.retain(|space, _| space == IMAGE_SPACE || langs.iter().any(|l| l == space));
    }
    vectors.retain(|_, spaces| !spaces.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::activity_store::MockActivityStore;
    use crate::db::Cache;
    use crate::models::{PersonalAverage, PostAverage};
    use crate::services::decrypt::DecryptPool;
    use crate::services::keys::{generate_activity_keypair, seal, ActivityKeypair};
    use crate::services::providers::MockSearchBackend;
    use serde_json::json;

    async fn test_cache() -> Cache {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let (cache, handle) = Cache::new(client).await;
        std::mem::forget(handle);
        cache
    }

    fn sealed_row(keypair: &ActivityKeypair, author: &str, rank: i64) -> crate::models::EncryptedRow {
        let metadata = json!({"author": author, "permlink": "p"}).to_string();
        crate::models::EncryptedRow {
            metadata_id: format!("id-{author}"),
            metadata: seal(&keypair.public_pem, metadata.as_bytes()).unwrap(),
            created: seal(&keypair.public_pem, b"2026-08-23T12:00:00Z").unwrap(),
            event_count: 3,
            rank,
        }
    }

    fn scoring_store(keypair: &ActivityKeypair) -> MockActivityStore {
        let rows = vec![sealed_row(keypair, "alice", 0)];
        let mut store = MockActivityStore::new();
        store
            .expect_grouped_user_events()
            .returning(move |_, _, _| Ok(rows.clone()));
        store
            .expect_personal_average()
            .returning(|_, _| Ok(PersonalAverage { avg: 1.0, posts: 1, total: 3 }));
        store
            .expect_global_average()
            .returning(|_, _, _| Ok(PostAverage { avg: 1.0, users: 1, total: 1 }));
        store
            .expect_user_records_by_rank()
            .returning(|_, _, _, _| Ok(Vec::new()));
        store
    }

    fn allow_profile_fill(search: &mut MockSearchBackend) {
        search.expect_latest_authored().returning(|_, _| Ok(Vec::new()));
        search.expect_latest_upvoted().returning(|_, _| Ok(Vec::new()));
    }

    fn assembler(store: MockActivityStore, search: MockSearchBackend, cache: Cache) -> FeedAssembler {
        let store = Arc::new(store);
        let search: Arc<dyn SearchBackend> = Arc::new(search);
        let ledger = ActivityLedger::new(
            Arc::clone(&store) as Arc<dyn crate::db::ActivityStore>,
            Arc::clone(&search),
            DecryptPool::new(Some(2)),
            cache,
        );
        let similar = SimilarityAggregator::new(Arc::clone(&search));
        FeedAssembler::new(ledger, similar, search)
    }

    #[tokio::test]
    async fn test_feed_round_trip() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let store = scoring_store(&keypair);
        let mut search = MockSearchBackend::new();
        allow_profile_fill(&mut search);
        search.expect_post_vectors().returning(|ids| {
            let mut vectors = HashMap::new();
            for id in ids {
                let mut spaces = DocumentVectors::new();
                spaces.insert("en".to_string(), vec![0.1, 0.2]);
                vectors.insert(id.clone(), spaces);
            }
            Ok(vectors)
        });
        search
            .expect_similar_posts()
            .withf(|_, _, _, filter| {
                filter.exclude_author.as_deref() == Some("carol")
                    && filter.exclude_ids.iter().any(|id| id.as_str() == "alice/p")
            })
            .returning(|_, _, _, _| Ok(vec![vec![(PostId::new("bob", "fresh"), 0.9)]]));
        search.expect_resolve_posts().returning(|ids| {
            Ok(ids
                .iter()
                .map(|id| {
                    let (author, permlink) = id.as_str().split_once('/').unwrap();
                    AuthorPermlink {
                        author: author.to_string(),
                        permlink: permlink.to_string(),
                    }
                })
                .collect())
        });

        let cache = test_cache().await;
        let feed = assembler(store, search, cache)
            .build_feed("carol", "anon-carol", &key, 10, &FeedFilter::default())
            .await
            .unwrap();

        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].author, "bob");
        assert_eq!(feed[0].permlink, "fresh");
    }

    #[tokio::test]
    async fn test_all_scored_posts_are_excluded_from_expansion() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        // More scored posts than the sampler keeps as seeds.
        let total = SAMPLE_SIZE + 5;
        let rows: Vec<_> = (0..total)
            .map(|i| sealed_row(&keypair, &format!("a{i}"), i as i64))
            .collect();
        let mut store = MockActivityStore::new();
        store
            .expect_grouped_user_events()
            .returning(move |_, _, _| Ok(rows.clone()));
        store
            .expect_personal_average()
            .returning(|_, _| Ok(PersonalAverage { avg: 1.0, posts: 40, total: 120 }));
        store
            .expect_global_average()
            .returning(|_, _, _| Ok(PostAverage { avg: 1.0, users: 1, total: 1 }));
        store
            .expect_user_records_by_rank()
            .returning(|_, _, _, _| Ok(Vec::new()));

        let mut search = MockSearchBackend::new();
        search.expect_post_vectors().returning(|ids| {
            let mut vectors = HashMap::new();
            for id in ids {
                let mut spaces = DocumentVectors::new();
                spaces.insert("en".to_string(), vec![0.1, 0.2]);
                vectors.insert(id.clone(), spaces);
            }
            Ok(vectors)
        });
        search
            .expect_similar_posts()
            .withf(move |_, _, _, filter| {
                filter.exclude_ids.len() == total
                    && (0..total).all(|i| {
                        let id = format!("a{i}/p");
                        filter.exclude_ids.iter().any(|e| e.as_str() == id)
                    })
            })
            .returning(|_, _, _, _| Ok(vec![vec![(PostId::new("bob", "fresh"), 0.9)]]));
        search.expect_resolve_posts().returning(|_| {
            Ok(vec![AuthorPermlink {
                author: "bob".to_string(),
                permlink: "fresh".to_string(),
            }])
        });

        let cache = test_cache().await;
        let feed = assembler(store, search, cache)
            .build_feed("carol", "anon-carol", &key, 10, &FeedFilter::default())
            .await
            .unwrap();

        assert_eq!(feed.len(), 1);
    }

    #[tokio::test]
    async fn test_expansion_failure_degrades_to_empty_feed() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let store = scoring_store(&keypair);
        let mut search = MockSearchBackend::new();
        allow_profile_fill(&mut search);
        search.expect_post_vectors().returning(|ids| {
            let mut vectors = HashMap::new();
            for id in ids {
                let mut spaces = DocumentVectors::new();
                spaces.insert("en".to_string(), vec![0.1]);
                vectors.insert(id.clone(), spaces);
            }
            Ok(vectors)
        });
        search
            .expect_similar_posts()
            .returning(|_, _, _, _| Err(AppError::Dependency("index down".to_string())));

        let cache = test_cache().await;
        let feed = assembler(store, search, cache)
            .build_feed("carol", "anon-carol", &key, 10, &FeedFilter::default())
            .await
            .unwrap();

        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn test_filtered_requests_raise_k() {
        let keypair = generate_activity_keypair().unwrap();
        let key = ActivityPrivateKey::from_pem(&keypair.private_pem).unwrap();

        let store = scoring_store(&keypair);
        let mut search = MockSearchBackend::new();
        search.expect_latest_authored().returning(|_, _| Ok(Vec::new()));
        search.expect_latest_upvoted().returning(|_, _| Ok(Vec::new()));
        search.expect_post_vectors().returning(|ids| {
            let mut vectors = HashMap::new();
            for id in ids {
                let mut spaces = DocumentVectors::new();
                spaces.insert("en".to_string(), vec![0.1]);
                vectors.insert(id.clone(), spaces);
            }
            Ok(vectors)
        });
        search
            .expect_similar_posts()
            .withf(|_, _, k, filter| *k == K_FILTERED && filter.tags == vec!["travel".to_string()])
            .returning(|_, _, _, _| Ok(vec![vec![(PostId::new("bob", "trip"), 0.7)]]));
        search.expect_resolve_posts().returning(|_| {
            Ok(vec![AuthorPermlink {
                author: "bob".to_string(),
                permlink: "trip".to_string(),
            }])
        });

        let filter = FeedFilter {
            tags: vec!["travel".to_string()],
            ..Default::default()
        };
        let cache = test_cache().await;
        let feed = assembler(store, search, cache)
            .build_feed("carol", "anon-carol", &key, 10, &filter)
            .await
            .unwrap();

        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn test_language_filter_keeps_image_space() {
        let mut vectors: HashMap<PostId, DocumentVectors> = HashMap::new();
        let mut spaces = DocumentVectors::new();
        spaces.insert("en".to_string(), vec![0.1]);
        spaces.insert("de".to_string(), vec![0.2]);
        spaces.insert(IMAGE_SPACE.to_string(), vec![0.3]);
        vectors.insert(PostId::new("a", "p"), spaces);

        let mut other = DocumentVectors::new();
        other.insert("de".to_string(), vec![0.4]);
        vectors.insert(PostId::new("b", "q"), other);

        filter_spaces(&mut vectors, &["en".to_string()]);

        let kept = vectors.get(&PostId::new("a", "p")).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains_key("en"));
        assert!(kept.contains_key(IMAGE_SPACE));
        // The German-only post has no usable space left.
        assert!(!vectors.contains_key(&PostId::new("b", "q")));
    }
}
