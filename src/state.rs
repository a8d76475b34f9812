use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    config::Config,
    db::{create_redis_client, ActivityStore, Cache, CacheWriterHandle, PgActivityStore},
    services::{
        accounts::AccountService,
        decrypt::DecryptPool,
        feed::FeedAssembler,
        ledger::ActivityLedger,
        providers::{ChainBridgeClient, IdentityBridge, OpenSearchBackend, SearchBackend},
        similar::SimilarityAggregator,
    },
};

/// Shared application state: the wired service graph.
///
/// Everything inside is cheaply cloneable; axum clones the state per
/// request.
#[derive(Clone)]
pub struct AppState {
    pub accounts: AccountService,
    pub ledger: ActivityLedger,
    pub feed: FeedAssembler,
    pub search: Arc<dyn SearchBackend>,
}

impl AppState {
    /// Wires the production backends. The returned writer handle must be
    /// kept alive for the lifetime of the process; dropping it stops the
    /// cache writer.
    pub async fn new(config: &Config, pool: PgPool) -> anyhow::Result<(Self, CacheWriterHandle)> {
        let redis_client = create_redis_client(&config.redis_url)?;
        let (cache, writer_handle) = Cache::new(redis_client).await;

        let store: Arc<dyn ActivityStore> = Arc::new(PgActivityStore::new(pool));
        let search: Arc<dyn SearchBackend> = Arc::new(OpenSearchBackend::new(
            config.search_url.clone(),
            config.posts_index.clone(),
            config.recent_posts_index.clone(),
        ));
        let bridge: Arc<dyn IdentityBridge> = Arc::new(ChainBridgeClient::new(
            config.identity_bridge_url.clone(),
            cache.clone(),
        ));

        let state = Self::with_backends(config, store, search, bridge, cache);
        Ok((state, writer_handle))
    }

    /// Wires the service graph over caller-provided backends. Tests use
    /// this with mocked capabilities.
    pub fn with_backends(
        config: &Config,
        store: Arc<dyn ActivityStore>,
        search: Arc<dyn SearchBackend>,
        bridge: Arc<dyn IdentityBridge>,
        cache: Cache,
    ) -> Self {
        let decrypt = DecryptPool::new(config.decrypt_workers);
        let accounts = AccountService::new(
            Arc::clone(&store),
            bridge,
            config.device_limit,
            config.registration_cooldown_secs,
        );
        let ledger = ActivityLedger::new(store, Arc::clone(&search), decrypt, cache);
        let similar = SimilarityAggregator::new(Arc::clone(&search));
        let feed = FeedAssembler::new(ledger.clone(), similar, Arc::clone(&search));

        Self {
            accounts,
            ledger,
            feed,
            search,
        }
    }
}
