/// OpenSearch vector index backend
///
/// Posts are indexed with their embedding vectors under `doc_vectors.<space>`
/// (one space per detected language plus the image space). Similarity runs
/// as a k-NN `script_score` query with the cosine space type; one `_msearch`
/// request carries the whole batch of query vectors so a feed request costs
/// a single round trip per vector space.
use std::collections::HashMap;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    models::{AuthorPermlink, DocumentVectors, PostId},
    services::providers::{SearchBackend, SimilarityFilter},
};

#[derive(Clone)]
pub struct OpenSearchBackend {
    http_client: HttpClient,
    base_url: String,
    /// Full index of published posts, used for lookups and resolution.
    posts_index: String,
    /// Rolling index of recent posts, used as the candidate pool.
    recent_posts_index: String,
}

impl OpenSearchBackend {
    pub fn new(base_url: String, posts_index: String, recent_posts_index: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            posts_index,
            recent_posts_index,
        }
    }

    async fn post_json(&self, path: &str, body: String) -> AppResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "search backend returned status {}: {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }
}

/// Bool query restricting k-NN candidates: the vector field must exist,
/// excluded authors/ids are filtered out before scoring so they never
/// consume a result slot.
fn candidate_query(space: &str, filter: &SimilarityFilter) -> Value {
    let field = format!("doc_vectors.{}", space);

    let mut must = vec![json!({"exists": {"field": field}})];
    if !filter.tags.is_empty() {
        must.push(json!({"terms": {"tags": filter.tags}}));
    }
    if !filter.parent_permlinks.is_empty() {
        must.push(json!({"terms": {"parent_permlink": filter.parent_permlinks}}));
    }

    let mut must_not = Vec::new();
    if let Some(author) = &filter.exclude_author {
        must_not.push(json!({"term": {"author": author}}));
    }
    if !filter.exclude_ids.is_empty() {
        let ids: Vec<&str> = filter.exclude_ids.iter().map(PostId::as_str).collect();
        must_not.push(json!({"ids": {"values": ids}}));
    }

    json!({"bool": {"must": must, "must_not": must_not}})
}

fn knn_search_body(space: &str, query_vector: &[f32], k: usize, filter: &SimilarityFilter) -> Value {
    json!({
        "size": k,
        "_source": false,
        "query": {
            "script_score": {
                "query": candidate_query(space, filter),
                "script": {
                    "source": "knn_score",
                    "lang": "knn",
                    "params": {
                        "field": format!("doc_vectors.{}", space),
                        "query_value": query_vector,
                        "space_type": "cosinesimil"
                    }
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct MsearchResponse {
    responses: Vec<SearchHits>,
}

#[derive(Deserialize, Default)]
struct SearchHits {
    #[serde(default)]
    hits: HitsEnvelope,
}

#[derive(Deserialize, Default)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: f64,
}

#[derive(Deserialize)]
struct MgetResponse {
    docs: Vec<MgetDoc>,
}

#[derive(Deserialize)]
struct MgetDoc {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
}

#[async_trait::async_trait]
impl SearchBackend for OpenSearchBackend {
    async fn similar_posts(
        &self,
        space: &str,
        query_vectors: &[Vec<f32>],
        k: usize,
        filter: &SimilarityFilter,
    ) -> AppResult<Vec<Vec<(PostId, f64)>>> {
        if query_vectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut ndjson = String::new();
        for query_vector in query_vectors {
            ndjson.push_str(&json!({"index": self.recent_posts_index}).to_string());
            ndjson.push('\n');
            ndjson.push_str(&knn_search_body(space, query_vector, k, filter).to_string());
            ndjson.push('\n');
        }

        let raw = self.post_json("/_msearch", ndjson).await?;
        let parsed: MsearchResponse = serde_json::from_value(raw)
            .map_err(|e| AppError::Dependency(format!("bad _msearch response: {e}")))?;

        Ok(parsed
            .responses
            .into_iter()
            .map(|response| {
                response
                    .hits
                    .hits
                    .into_iter()
                    .map(|hit| (PostId(hit.id), hit.score))
                    .collect()
            })
            .collect())
    }

    async fn post_vectors(&self, ids: &[PostId]) -> AppResult<HashMap<PostId, DocumentVectors>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let body = json!({
            "docs": ids.iter().map(|id| json!({
                "_id": id.as_str(),
                "_source": ["doc_vectors"]
            })).collect::<Vec<_>>()
        });

        let raw = self
            .post_json(&format!("/{}/_mget", self.posts_index), body.to_string())
            .await?;
        let parsed: MgetResponse = serde_json::from_value(raw)
            .map_err(|e| AppError::Dependency(format!("bad _mget response: {e}")))?;

        let mut vectors = HashMap::new();
        for doc in parsed.docs {
            if !doc.found {
                continue;
            }
            let Some(source) = doc.source else { continue };
            let Some(doc_vectors) = source.get("doc_vectors") else {
                continue;
            };
            if let Ok(spaces) = serde_json::from_value::<DocumentVectors>(doc_vectors.clone()) {
                if !spaces.is_empty() {
                    vectors.insert(PostId(doc.id), spaces);
                }
            }
        }
        Ok(vectors)
    }

    async fn latest_authored(&self, author: &str, limit: usize) -> AppResult<Vec<PostId>> {
        let body = json!({
            "size": limit,
            "_source": false,
            "query": {"term": {"author": author}},
            "sort": [{"timestamp": "desc"}]
        });

        let raw = self
            .post_json(&format!("/{}/_search", self.posts_index), body.to_string())
            .await?;
        let parsed: SearchHits = serde_json::from_value(raw)
            .map_err(|e| AppError::Dependency(format!("bad _search response: {e}")))?;

        Ok(parsed.hits.hits.into_iter().map(|h| PostId(h.id)).collect())
    }

    async fn latest_upvoted(&self, voter: &str, limit: usize) -> AppResult<Vec<PostId>> {
        // `strong_upvoters` carries the voters who cast a full-weight vote.
        let body = json!({
            "size": limit,
            "_source": false,
            "query": {"term": {"strong_upvoters": voter}},
            "sort": [{"timestamp": "desc"}]
        });

        let raw = self
            .post_json(&format!("/{}/_search", self.posts_index), body.to_string())
            .await?;
        let parsed: SearchHits = serde_json::from_value(raw)
            .map_err(|e| AppError::Dependency(format!("bad _search response: {e}")))?;

        Ok(parsed.hits.hits.into_iter().map(|h| PostId(h.id)).collect())
    }

    async fn resolve_posts(&self, ids: &[PostId]) -> AppResult<Vec<AuthorPermlink>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "docs": ids.iter().map(|id| json!({
                "_id": id.as_str(),
                "_source": ["author", "permlink"]
            })).collect::<Vec<_>>()
        });

        let raw = self
            .post_json(&format!("/{}/_mget", self.posts_index), body.to_string())
            .await?;
        let parsed: MgetResponse = serde_json::from_value(raw)
            .map_err(|e| AppError::Dependency(format!("bad _mget response: {e}")))?;

        let mut resolved = Vec::new();
        for doc in parsed.docs {
            if !doc.found {
                continue;
            }
            let Some(source) = doc.source else { continue };
            if let Ok(post) = serde_json::from_value::<AuthorPermlink>(source) {
                resolved.push(post);
            }
        }
        Ok(resolved)
    }
}
