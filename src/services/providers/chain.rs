/// Identity bridge client
///
/// The bridge fronts the blockchain node: it resolves account names to
/// their current memo keys and performs memo encode/decode with the
/// service's own memo credentials. Account lookups are cached; memo
/// operations are per-request and never cached.
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use crate::{
    cached,
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    services::providers::{ChainAccount, IdentityBridge},
};

const ACCOUNT_CACHE_TTL: u64 = 300; // 5 minutes

#[derive(Clone)]
pub struct ChainBridgeClient {
    http_client: HttpClient,
    base_url: String,
    cache: Cache,
}

impl ChainBridgeClient {
    pub fn new(base_url: String, cache: Cache) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        }
    }

    async fn fetch_account(&self, username: &str) -> AppResult<Option<ChainAccount>> {
        let url = format!("{}/accounts/{}", self.base_url, username);
        let response = self.http_client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "identity bridge returned status {}: {}",
                status, body
            )));
        }

        let account: ChainAccount = response.json().await?;
        Ok(Some(account))
    }
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    memo_key: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
struct EncodeResponse {
    memo: String,
}

#[derive(Serialize)]
struct DecodeRequest<'a> {
    username: &'a str,
    memo: &'a str,
}

#[derive(Deserialize)]
struct DecodeResponse {
    message: String,
}

#[async_trait::async_trait]
impl IdentityBridge for ChainBridgeClient {
    async fn lookup_account(&self, username: &str) -> AppResult<Option<ChainAccount>> {
        cached!(
            self.cache,
            CacheKey::ChainAccount(username.to_string()),
            ACCOUNT_CACHE_TTL,
            self.fetch_account(username)
        )
    }

    async fn seal_memo(&self, memo_key: &str, message: &str) -> AppResult<String> {
        let url = format!("{}/memo/encode", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&EncodeRequest { memo_key, message })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "identity bridge returned status {}: {}",
                status, body
            )));
        }

        let encoded: EncodeResponse = response.json().await?;
        Ok(encoded.memo)
    }

    async fn open_memo(&self, username: &str, memo: &str) -> AppResult<Option<String>> {
        let url = format!("{}/memo/decode", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&DecodeRequest { username, memo })
            .send()
            .await?;

        // A memo the bridge cannot decode is a failed proof, not an outage.
        if response.status().is_client_error() {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "identity bridge returned status {}: {}",
                status, body
            )));
        }

        let decoded: DecodeResponse = response.json().await?;
        Ok(Some(decoded.message))
    }
}
