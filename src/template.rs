//! Benchmark template registry.

use crate::cache::{CacheKey, MemoCache};
use crate::error::IngestError;
use crate::models::{template_key, BenchmarkTemplate};
use crate::object_store::ObjectStore;

use std::sync::Arc;
use validator::Validate;

/// Number of templates retained by the registry cache.
const TEMPLATE_CACHE_CAPACITY: usize = 64;

/// Load and validate a benchmark's template from object storage.
///
/// # Arguments
///
/// * `store`: Object store holding the templates
/// * `bucket`: Bucket holding the templates
/// * `benchmark_id`: Benchmark identifier
pub async fn load_template(
    store: &dyn ObjectStore,
    bucket: &str,
    benchmark_id: &str,
) -> Result<BenchmarkTemplate, IngestError> {
    let key = template_key(benchmark_id);
    let data = match store.get(bucket, &key, None).await {
        Ok(data) => data,
        Err(IngestError::ObjectNotFound { .. }) => {
            return Err(IngestError::TemplateNotFound {
                benchmark_id: benchmark_id.to_string(),
            })
        }
        Err(err) => return Err(err),
    };
    let invalid = |reason: String| IngestError::TemplateInvalid {
        benchmark_id: benchmark_id.to_string(),
        reason,
    };
    let mut template: BenchmarkTemplate =
        serde_json::from_slice(&data).map_err(|err| invalid(err.to_string()))?;
    template
        .validate()
        .map_err(|err| invalid(err.to_string().replace('\n', "; ")))?;
    if template.benchmark_id.is_empty() {
        template.benchmark_id = benchmark_id.to_string();
    }
    tracing::debug!(
        benchmark_id,
        files = template.files.len(),
        "loaded benchmark template"
    );
    Ok(template)
}

/// Memoising front end to [load_template].
pub struct TemplateRegistry {
    cache: MemoCache<Arc<BenchmarkTemplate>>,
}

impl TemplateRegistry {
    /// Create a registry whose entries live for `lifespan` seconds. Zero disables caching.
    pub fn new(lifespan: u64) -> Self {
        Self {
            cache: MemoCache::new(TEMPLATE_CACHE_CAPACITY, lifespan),
        }
    }

    /// Returns the template for a benchmark, loading it if it is not cached.
    pub async fn get(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        benchmark_id: &str,
    ) -> Result<Arc<BenchmarkTemplate>, IngestError> {
        let key = CacheKey::new("load_template", &[bucket, benchmark_id]);
        self.cache
            .get_or_try_insert_with(key, || async {
                load_template(store, bucket, benchmark_id).await.map(Arc::new)
            })
            .await
    }
}
