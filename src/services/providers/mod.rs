/// External data provider abstractions
///
/// The feed pipeline talks to two out-of-process backends: the vector
/// search index holding post embeddings, and the identity bridge fronting
/// the blockchain account registry and its memo cryptography. Both sit
/// behind traits so the ledger, authenticator and assembler stay testable
/// without live backends.
use std::collections::HashMap;

use crate::{
    error::AppResult,
    models::{AuthorPermlink, DocumentVectors, PostId},
};

pub mod chain;
pub mod search;

pub use chain::ChainBridgeClient;
pub use search::OpenSearchBackend;

/// Candidate constraints applied inside the search backend, so excluded
/// posts never consume one of the `k` result slots.
#[derive(Debug, Clone, Default)]
pub struct SimilarityFilter {
    /// Author to exclude (the requesting user's own posts).
    pub exclude_author: Option<String>,
    /// Post ids already seen or sampled; excluded from candidates.
    pub exclude_ids: Vec<PostId>,
    pub tags: Vec<String>,
    pub parent_permlinks: Vec<String>,
}

/// Vector search over published posts.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    /// k-nearest posts for each query vector within one vector space,
    /// cosine-scored, most similar first. Returns one candidate list per
    /// query vector, in input order.
    async fn similar_posts(
        &self,
        space: &str,
        query_vectors: &[Vec<f32>],
        k: usize,
        filter: &SimilarityFilter,
    ) -> AppResult<Vec<Vec<(PostId, f64)>>>;

    /// Stored embedding vectors for the given posts. Posts missing from
    /// the index are absent from the map.
    async fn post_vectors(&self, ids: &[PostId]) -> AppResult<HashMap<PostId, DocumentVectors>>;

    /// The author's most recent posts, newest first.
    async fn latest_authored(&self, author: &str, limit: usize) -> AppResult<Vec<PostId>>;

    /// Posts the user recently up-voted with full weight, newest first.
    async fn latest_upvoted(&self, voter: &str, limit: usize) -> AppResult<Vec<PostId>>;

    /// Filters the given ids down to posts that still exist in the index,
    /// resolved to author/permlink pairs in input order.
    async fn resolve_posts(&self, ids: &[PostId]) -> AppResult<Vec<AuthorPermlink>>;
}

/// An on-chain account as the identity bridge reports it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainAccount {
    pub name: String,
    pub memo_key: String,
}

/// Blockchain identity operations: account lookup and memo cryptography.
///
/// Memos are sealed to an account's memo key, so only the account owner
/// can open them; the bridge holds the service's own memo credentials and
/// performs both directions.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IdentityBridge: Send + Sync {
    async fn lookup_account(&self, username: &str) -> AppResult<Option<ChainAccount>>;

    /// Seals `message` to the given account memo key.
    async fn seal_memo(&self, memo_key: &str, message: &str) -> AppResult<String>;

    /// Opens a memo sealed to the service's own memo key by `username`.
    /// Returns `None` when the memo fails to decode, which is an
    /// authentication failure rather than a bridge outage.
    async fn open_memo(&self, username: &str, memo: &str) -> AppResult<Option<String>>;
}
