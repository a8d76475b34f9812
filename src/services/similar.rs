use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    error::{AppError, AppResult},
    models::{DocumentVectors, PostId},
    services::providers::{SearchBackend, SimilarityFilter},
};

/// Expands a sample of posts into similarity-weighted candidates.
///
/// Query vectors are grouped by vector space and each space runs as one
/// batched k-NN search. Within a space a candidate's similarities are
/// summed across the sampled posts and normalized by the sample size, so
/// a candidate close to many sampled posts outranks one close to a
/// single post. Across spaces, and when a candidate resurfaces, the
/// highest weight wins.
#[derive(Clone)]
pub struct SimilarityAggregator {
    search: Arc<dyn SearchBackend>,
}

impl SimilarityAggregator {
    pub fn new(search: Arc<dyn SearchBackend>) -> Self {
        Self { search }
    }

    pub async fn expand(
        &self,
        sample_vectors: &HashMap<PostId, DocumentVectors>,
        k: usize,
        filter: &SimilarityFilter,
    ) -> AppResult<Vec<(PostId, f64)>> {
        let sample_size = sample_vectors.len();
        if sample_size == 0 {
            return Ok(Vec::new());
        }

        let mut by_space: HashMap<String, Vec<Vec<f32>>> = HashMap::new();
        for spaces in sample_vectors.values() {
            for (space, vector) in spaces {
                by_space
                    .entry(space.clone())
                    .or_default()
                    .push(vector.clone());
            }
        }

        let mut handles = Vec::with_capacity(by_space.len());
        for (space, vectors) in by_space {
            let search = Arc::clone(&self.search);
            let filter = filter.clone();
            handles.push(tokio::spawn(async move {
                let results = search.similar_posts(&space, &vectors, k, &filter).await?;

                let mut summed: HashMap<PostId, f64> = HashMap::new();
                for candidates in results {
                    for (post_id, similarity) in candidates {
                        *summed.entry(post_id).or_default() += similarity;
                    }
                }
                for weight in summed.values_mut() {
                    *weight /= sample_size as f64;
                }
                Ok::<_, AppError>(summed)
            }));
        }

        let mut merged: HashMap<PostId, f64> = HashMap::new();
        for handle in handles {
            let summed = handle
                .await
                .map_err(|e| AppError::Internal(format!("expansion task failed: {e}")))??;
            for (post_id, weight) in summed {
                let entry = merged.entry(post_id).or_insert(weight);
                if weight > *entry {
                    *entry = weight;
                }
            }
        }

        Ok(merged.into_iter().collect())
    }
}
