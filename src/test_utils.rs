use crate::error::IngestError;
use crate::models::{AxisSpec, BenchmarkTemplate, FileSpec, GridSpec, VarDef};
use crate::object_store::{ObjectMetadata, ObjectStore};

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A stored object and its user metadata.
#[derive(Clone, Debug)]
pub(crate) struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// In-memory [ObjectStore] for tests.
#[derive(Default)]
pub(crate) struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    /// Number of `get` calls made, for checking memoisation.
    pub gets: AtomicUsize,
    /// Keys for which `get` fails with a transport-style error, with the number of failures left.
    failing: Mutex<BTreeMap<String, usize>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>, metadata: &[(&str, &str)]) {
        let metadata = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: "application/octet-stream".to_string(),
                metadata,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Make the next `times` gets of `key` fail.
    pub fn fail_gets_for(&self, key: &str, times: usize) {
        self.failing.lock().unwrap().insert(key.to_string(), times);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        limit: Option<u64>,
    ) -> Result<Bytes, IngestError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(remaining) = self.failing.lock().unwrap().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::S3GetObject(SdkError::timeout_error(
                    "connection reset",
                )));
            }
        }
        let object = self.object(bucket, key).ok_or(IngestError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let size = object.body.len() as u64;
        match limit {
            Some(limit) if size > limit => Err(IngestError::ArchiveTooLarge { size, limit }),
            _ => Ok(object.body),
        }
    }

    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, IngestError> {
        self.object(bucket, key)
            .map(|object| object.metadata)
            .ok_or(IngestError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<(), IngestError> {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}

/// Build a zip archive from (entry name, contents) pairs.
pub(crate) fn make_zip(entries: &[(&str, &str)]) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
        } else {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }
    writer.finish().unwrap().into_inner().into()
}

/// Template with one gridded `slip` file of x, y, value over a 3x3 lattice on [0, 10].
pub(crate) fn get_test_template() -> BenchmarkTemplate {
    BenchmarkTemplate {
        benchmark_id: "bp1-qd".to_string(),
        files: vec![FileSpec {
            prefix: "slip".to_string(),
            file_type: "dat".to_string(),
            var_list: vec![VarDef::new("x"), VarDef::new("y"), VarDef::new("value")],
            grid: Some(GridSpec {
                x: AxisSpec::new(0.0, 10.0, 3),
                y: AxisSpec::new(0.0, 10.0, 3),
            }),
        }],
    }
}

/// Template with an ungridded fault station time series file.
pub(crate) fn get_test_timeseries_template() -> BenchmarkTemplate {
    BenchmarkTemplate {
        benchmark_id: "bp1-qd".to_string(),
        files: vec![FileSpec {
            prefix: "fltst".to_string(),
            file_type: "dat".to_string(),
            var_list: vec![
                VarDef::new("t"),
                VarDef::new("slip"),
                VarDef::new("slip_rate"),
            ],
            grid: None,
        }],
    }
}
