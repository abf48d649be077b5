//! Queries over published datasets.
//!
//! A dataset is one `{code_name}_{version}` directory under a benchmark's public prefix. Queries
//! select series from the Parquet files of several datasets at once. Files are fetched
//! concurrently, and a fetch that fails is logged and left out of the result rather than failing
//! the whole query.

use crate::cache::{CacheKey, MemoCache};
use crate::columnar::{decode_table, PARQUET_EXTENSION};
use crate::error::IngestError;
use crate::models::PUBLIC_PREFIX;
use crate::object_store::SharedObjectStore;
use crate::pipeline::file_stem;
use crate::table::Table;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use validator::{Validate, ValidationError};

/// Number of benchmark listings retained by the cache.
const LISTING_CACHE_CAPACITY: usize = 128;

/// Name of the time column from which derived time columns are computed.
const TIME_COLUMN: &str = "t";

/// Selects the files of a dataset that a query reads.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetQuery {
    /// Fault station time series at a depth, e.g. `fltst_dp075`
    TimeSeries { depth: String },
    /// Off-fault receiver time series, e.g. `blkst_rcv03`
    Receiver { receiver: String },
    /// Surface files with a common prefix, e.g. `slip`
    Surface { prefix: String },
}

impl DatasetQuery {
    /// Returns whether the file with the given stem belongs to this query.
    pub fn matches(&self, stem: &str) -> bool {
        match self {
            DatasetQuery::TimeSeries { depth } => stem.ends_with(&format!("dp{depth}")),
            DatasetQuery::Receiver { receiver } => stem.ends_with(&format!("rcv{receiver}")),
            DatasetQuery::Surface { prefix } => stem.starts_with(prefix.as_str()),
        }
    }
}

/// Unit of derived time columns.
#[derive(Clone, Copy, Debug, Default, Deserialize, strum_macros::Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Seconds,
    Hours,
    Days,
    Years,
}

impl TimeUnit {
    /// Returns the number of seconds in one unit.
    pub fn seconds(&self) -> f64 {
        const HOUR: f64 = 3600.0;
        const DAY: f64 = 24.0 * HOUR;
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Hours => HOUR,
            TimeUnit::Days => DAY,
            TimeUnit::Years => 365.25 * DAY,
        }
    }

    /// Returns the name of the derived time column.
    pub fn column_name(&self) -> String {
        format!("{TIME_COLUMN}_{self}")
    }
}

/// Body of a dataset query request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct QueryRequest {
    /// Names of the datasets to query
    #[validate(length(min = 1, message = "at least one dataset is required"))]
    #[validate(custom = "validate_dataset_names")]
    pub datasets: Vec<String>,
    /// Which files of each dataset to read
    pub query: DatasetQuery,
    /// Unit of derived time columns
    #[serde(default)]
    pub time_unit: TimeUnit,
}

/// Validate the dataset names of a query
fn validate_dataset_names(datasets: &[String]) -> Result<(), ValidationError> {
    if datasets
        .iter()
        .any(|name| name.is_empty() || name.contains('/'))
    {
        return Err(ValidationError::new(
            "dataset names must be non-empty and must not contain '/'",
        ));
    }
    Ok(())
}

/// Columns read from one published file.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DatasetSeries {
    /// `{dataset}_{file stem}`
    pub dataset_name: String,
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl DatasetSeries {
    /// Build a series from a table, adding a derived time column if it has a `t` column.
    fn new(dataset_name: String, table: &Table, time_unit: TimeUnit) -> Self {
        let mut columns: BTreeMap<String, Vec<f64>> = table
            .names()
            .iter()
            .zip(table.data().columns())
            .map(|(name, column)| (name.clone(), column.to_vec()))
            .collect();
        if let Some(t) = table.column(TIME_COLUMN) {
            let scale = time_unit.seconds();
            columns.insert(
                time_unit.column_name(),
                t.iter().map(|seconds| seconds / scale).collect(),
            );
        }
        DatasetSeries {
            dataset_name,
            columns,
        }
    }
}

/// Returns the public prefix of a benchmark.
fn benchmark_prefix(benchmark_id: &str) -> String {
    format!("{PUBLIC_PREFIX}{benchmark_id}/")
}

/// Read access to published datasets.
pub struct DatasetService {
    store: SharedObjectStore,
    bucket: String,
    listings: MemoCache<Arc<Vec<String>>>,
    fetch_concurrency: usize,
}

impl DatasetService {
    /// Return a new DatasetService.
    ///
    /// # Arguments
    ///
    /// * `store`: Object store holding published datasets
    /// * `bucket`: Bucket holding published datasets
    /// * `lifespan`: Lifespan in seconds of memoised listings. Zero disables memoisation.
    /// * `fetch_concurrency`: Maximum number of concurrent file fetches per query
    pub fn new(
        store: SharedObjectStore,
        bucket: &str,
        lifespan: u64,
        fetch_concurrency: usize,
    ) -> Self {
        DatasetService {
            store,
            bucket: bucket.to_string(),
            listings: MemoCache::new(LISTING_CACHE_CAPACITY, lifespan),
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Returns the sorted names of a benchmark's datasets.
    pub async fn list_datasets(&self, benchmark_id: &str) -> Result<Arc<Vec<String>>, IngestError> {
        let key = CacheKey::new("list_datasets", &[self.bucket.as_str(), benchmark_id]);
        self.listings
            .get_or_try_insert_with(key, || async {
                let prefix = benchmark_prefix(benchmark_id);
                let keys = self.store.list(&self.bucket, &prefix).await?;
                let names: BTreeSet<String> = keys
                    .iter()
                    .filter_map(|key| key.strip_prefix(&prefix))
                    .filter_map(|rest| rest.split_once('/'))
                    .map(|(dataset, _)| dataset.to_string())
                    .filter(|dataset| !dataset.is_empty())
                    .collect();
                Ok(Arc::new(names.into_iter().collect()))
            })
            .await
    }

    /// Returns the keys of the files in `dataset` selected by `query`.
    async fn matching_files(
        &self,
        benchmark_id: &str,
        dataset: &str,
        query: &DatasetQuery,
    ) -> Result<Vec<String>, IngestError> {
        let prefix = format!("{}{dataset}/", benchmark_prefix(benchmark_id));
        let extension = format!(".{PARQUET_EXTENSION}");
        Ok(self
            .store
            .list(&self.bucket, &prefix)
            .await?
            .into_iter()
            .filter(|key| key.ends_with(&extension) && query.matches(file_stem(key)))
            .collect())
    }

    /// Fetch one file as a series.
    async fn fetch(
        &self,
        semaphore: &Semaphore,
        dataset: &str,
        key: &str,
        time_unit: TimeUnit,
    ) -> Result<DatasetSeries, IngestError> {
        let _permit = semaphore.acquire().await?;
        let data = self.store.get(&self.bucket, key, None).await?;
        let table = decode_table(&data)?;
        Ok(DatasetSeries::new(
            format!("{dataset}_{}", file_stem(key)),
            &table,
            time_unit,
        ))
    }

    /// Fetch every series selected by a query.
    ///
    /// Fetches run concurrently and complete in no particular order. Failed fetches and empty
    /// files are left out of the result.
    pub async fn fetch_datasets(
        &self,
        benchmark_id: &str,
        request: &QueryRequest,
    ) -> Vec<DatasetSeries> {
        let listings = join_all(request.datasets.iter().map(|dataset| async move {
            match self
                .matching_files(benchmark_id, dataset, &request.query)
                .await
            {
                Ok(keys) => keys
                    .into_iter()
                    .map(|key| (dataset.as_str(), key))
                    .collect::<Vec<_>>(),
                Err(err) => {
                    tracing::warn!(%dataset, "failed to list dataset: {}", err.to_detail_string());
                    Vec::new()
                }
            }
        }))
        .await;

        let semaphore = Semaphore::new(self.fetch_concurrency);
        let semaphore = &semaphore;
        let fetches = listings.into_iter().flatten().map(|(dataset, key)| async move {
            match self.fetch(semaphore, dataset, &key, request.time_unit).await {
                Ok(series) if series.columns.values().any(|column| !column.is_empty()) => {
                    Some(series)
                }
                Ok(_) => None,
                Err(err) => {
                    tracing::warn!(%key, "failed to fetch dataset file: {}", err.to_detail_string());
                    None
                }
            }
        });
        let series: Vec<DatasetSeries> = join_all(fetches).await.into_iter().flatten().collect();
        tracing::debug!(
            benchmark_id,
            datasets = request.datasets.len(),
            series = series.len(),
            "fetched datasets"
        );
        series
    }
}
