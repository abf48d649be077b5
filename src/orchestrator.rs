//! Upload processing state machine.
//!
//! ```text
//!   event ──► StoreOriginalEvent ──► ResolveUser ──► Start ──► ProcessFile ──► Completed
//!                                        │                          │
//!                                        ▼                          ▼ (error, panic, timeout)
//!                                     Dropped                 HandleFailure ──► Failed
//! ```
//!
//! The failure handler works only from the stored original event. It re-derives the object
//! location and looks up the user id again rather than sharing state with the processing task,
//! which may have panicked or been cancelled.

use crate::cli::CommandLineArgs;
use crate::error::IngestError;
use crate::metrics::record_upload;
use crate::models::{ObjectRef, TriggerEvent, UPLOAD_PREFIX};
use crate::object_store::base_name;
use crate::pipeline::{Pipeline, USER_ID_METADATA_KEY};
use crate::status::{SharedStatusTable, Terminal};

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Final outcome of handling one upload event.
#[derive(Clone, Copy, Debug, strum_macros::Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    /// The upload was processed and its status recorded as `completed`
    Completed,
    /// Processing failed and the status was recorded as `failed`
    Failed,
    /// The event could not be attributed to a user and was discarded
    Dropped,
}

/// Timeout and retry policy.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Wall-clock limit for processing one upload, across all attempts
    pub processing_timeout: Duration,
    /// Maximum number of attempts after retryable errors
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_interval: Duration,
}

impl OrchestratorConfig {
    /// Returns an OrchestratorConfig built from command line arguments.
    pub fn new(args: &CommandLineArgs) -> Self {
        OrchestratorConfig {
            processing_timeout: Duration::from_secs(args.processing_timeout),
            max_attempts: args.max_attempts,
            retry_interval: Duration::from_secs(args.retry_interval),
        }
    }
}

/// Drives uploads through the processing state machine.
#[derive(Clone)]
pub struct Orchestrator {
    pipeline: Pipeline,
    status: SharedStatusTable,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Return a new Orchestrator.
    pub fn new(pipeline: Pipeline, status: SharedStatusTable, config: OrchestratorConfig) -> Self {
        Orchestrator {
            pipeline,
            status,
            config: Arc::new(config),
        }
    }

    /// Returns the uploaded objects in `event` that this service processes.
    pub fn uploads(event: &TriggerEvent) -> Vec<ObjectRef> {
        event
            .objects()
            .into_iter()
            .filter(|object| object.key.starts_with(UPLOAD_PREFIX))
            .collect()
    }

    /// Handle an object-created event for a single upload.
    ///
    /// Returns an error only if the failure handler itself fails.
    pub async fn run(&self, event: TriggerEvent) -> Result<Outcome, IngestError> {
        let start = Instant::now();
        let result = self.run_state_machine(event).await;
        let label = match &result {
            Ok(outcome) => outcome.to_string(),
            Err(_) => "error".to_string(),
        };
        record_upload(&label, start.elapsed());
        result
    }

    async fn run_state_machine(&self, event: TriggerEvent) -> Result<Outcome, IngestError> {
        // StoreOriginalEvent
        let stored_event = event;
        let Some(upload) = Self::uploads(&stored_event).into_iter().next() else {
            tracing::warn!(event = ?stored_event, "event references no uploads");
            return Ok(Outcome::Dropped);
        };

        // ResolveUser
        let user_id = match self.user_id(&upload).await {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::error!(
                    bucket = %upload.bucket,
                    key = %upload.key,
                    "dropping upload event: {}",
                    err.to_detail_string()
                );
                return Ok(Outcome::Dropped);
            }
        };
        let file_id = base_name(&upload.key);

        // Start, ProcessFile and the completed transition form the unit of work.
        let result = async {
            self.status.start(&user_id, file_id).await?;
            tracing::info!(%user_id, file_id, "processing upload");
            self.process(&upload, &user_id).await?;
            if !self.status.finish(&user_id, file_id, Terminal::Completed).await? {
                tracing::warn!(%user_id, file_id, "status was no longer processing");
            }
            Ok::<_, IngestError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(%user_id, file_id, "upload completed");
                Ok(Outcome::Completed)
            }
            Err(err) => self.handle_failure(&stored_event, err).await,
        }
    }

    /// Returns the uploading user's id from the object's user metadata.
    async fn user_id(&self, upload: &ObjectRef) -> Result<String, IngestError> {
        let metadata = self
            .pipeline
            .store()
            .head_metadata(&upload.bucket, &upload.key)
            .await?;
        metadata
            .get(USER_ID_METADATA_KEY)
            .filter(|user_id| !user_id.is_empty())
            .cloned()
            .ok_or_else(|| IngestError::MissingUserId {
                bucket: upload.bucket.clone(),
                key: upload.key.clone(),
            })
    }

    /// Run the pipeline in its own task, bounded by the processing timeout and retrying
    /// retryable errors.
    async fn process(&self, upload: &ObjectRef, user_id: &str) -> Result<(), IngestError> {
        let pipeline = self.pipeline.clone();
        let config = self.config.clone();
        let upload = upload.clone();
        let user_id = user_id.to_string();
        let mut task = tokio::spawn(async move {
            let mut attempt = 1;
            loop {
                match pipeline.process_upload(&upload, &user_id).await {
                    Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                        tracing::warn!(
                            attempt,
                            "retrying upload after error: {}",
                            err.to_detail_string()
                        );
                        attempt += 1;
                        tokio::time::sleep(config.retry_interval).await;
                    }
                    result => return result.map(|_| ()),
                }
            }
        });

        match tokio::time::timeout(self.config.processing_timeout, &mut task).await {
            Ok(joined) => joined?,
            Err(_) => {
                task.abort();
                Err(IngestError::ProcessingTimeout {
                    seconds: self.config.processing_timeout.as_secs(),
                })
            }
        }
    }

    /// Record the failure of an upload against its status record.
    async fn handle_failure(
        &self,
        event: &TriggerEvent,
        error: IngestError,
    ) -> Result<Outcome, IngestError> {
        let detail = error.to_detail_string();
        tracing::error!("upload failed: {}", detail);
        let result: Result<Outcome, IngestError> = async {
            let upload = Self::uploads(event)
                .into_iter()
                .next()
                .ok_or_else(|| IngestError::InvalidUploadKey {
                    key: String::new(),
                })?;
            let user_id = self.user_id(&upload).await?;
            let file_id = base_name(&upload.key);
            if !self
                .status
                .finish(&user_id, file_id, Terminal::Failed(detail))
                .await?
            {
                tracing::warn!(%user_id, file_id, "status was no longer processing");
            }
            Ok(Outcome::Failed)
        }
        .await;
        if let Err(err) = &result {
            tracing::error!("failed to record upload failure: {}", err.to_detail_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UploadStatus;
    use crate::object_store::{ObjectMetadata, ObjectStore, SharedObjectStore};
    use crate::pipeline::PipelineConfig;
    use crate::regrid::RegridConfig;
    use crate::resource_manager::ResourceManager;
    use crate::status::tests::temporary_table;
    use crate::status::StatusTable;
    use crate::template::TemplateRegistry;
    use crate::test_utils::{get_test_template, make_zip, MemoryObjectStore};

    use async_trait::async_trait;
    use bytes::Bytes;

    const BUCKET: &str = "bucket";
    const KEY: &str = "upload/bp1-qd/mycode_v1.zip";
    const FILE_ID: &str = "mycode_v1.zip";

    /// Fault injected into archive downloads.
    #[derive(Clone, Copy)]
    enum Fault {
        Hang,
        Panic,
    }

    struct FaultyObjectStore {
        inner: Arc<MemoryObjectStore>,
        fault: Fault,
    }

    #[async_trait]
    impl ObjectStore for FaultyObjectStore {
        async fn get(
            &self,
            bucket: &str,
            key: &str,
            limit: Option<u64>,
        ) -> Result<Bytes, IngestError> {
            if key == KEY {
                match self.fault {
                    Fault::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
                    Fault::Panic => panic!("simulated crash"),
                }
            }
            self.inner.get(bucket, key, limit).await
        }

        async fn head_metadata(
            &self,
            bucket: &str,
            key: &str,
        ) -> Result<ObjectMetadata, IngestError> {
            self.inner.head_metadata(bucket, key).await
        }

        async fn put(
            &self,
            bucket: &str,
            key: &str,
            body: Bytes,
            content_type: &str,
            metadata: &ObjectMetadata,
        ) -> Result<(), IngestError> {
            self.inner
                .put(bucket, key, body, content_type, metadata)
                .await
        }

        async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, IngestError> {
            self.inner.list(bucket, prefix).await
        }
    }

    fn populated_store(entries: &[(&str, &str)], metadata: &[(&str, &str)]) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert(
            BUCKET,
            "benchmark_templates/bp1-qd.json",
            serde_json::to_vec(&get_test_template()).unwrap(),
            &[],
        );
        store.insert(BUCKET, KEY, make_zip(entries), metadata);
        store
    }

    fn orchestrator(
        store: SharedObjectStore,
        status: SharedStatusTable,
        max_attempts: u32,
        timeout: Duration,
    ) -> Orchestrator {
        let pipeline = Pipeline::new(
            store,
            Arc::new(TemplateRegistry::new(0)),
            Arc::new(ResourceManager::new(None, None)),
            PipelineConfig {
                data_bucket: BUCKET.to_string(),
                max_archive_size: 1 << 20,
                max_entry_size: 1 << 20,
                regrid: RegridConfig::default(),
                use_rayon: false,
            },
        );
        Orchestrator::new(
            pipeline,
            status,
            OrchestratorConfig {
                processing_timeout: timeout,
                max_attempts,
                retry_interval: Duration::ZERO,
            },
        )
    }

    fn event() -> TriggerEvent {
        TriggerEvent::for_object(&ObjectRef {
            bucket: BUCKET.to_string(),
            key: KEY.to_string(),
        })
    }

    fn valid_entries() -> [(&'static str, &'static str); 1] {
        [("slip_v1.dat", "x y value\n0 0 1.0\n10 10 2.0\n")]
    }

    #[tokio::test]
    async fn completed() {
        let store = populated_store(&valid_entries(), &[("userid", "user-1")]);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store.clone(), status.clone(), 1, Duration::from_secs(60));
        assert_eq!(Outcome::Completed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        assert_eq!(UploadStatus::Completed, record.status);
        assert!(store
            .object(BUCKET, "public_ds/bp1-qd/mycode_v1/slip_v1.parquet")
            .is_some());
    }

    #[tokio::test]
    async fn fatal_error_recorded_as_failed() {
        let store = populated_store(&[("slip_v1.dat", "x y value\n")], &[("userid", "user-1")]);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_secs(60));
        assert_eq!(Outcome::Failed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        assert_eq!(UploadStatus::Failed, record.status);
        let error = record.error.unwrap();
        assert!(error.contains("no input points"), "{error}");
    }

    #[tokio::test]
    async fn missing_template_recorded_as_failed() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert(BUCKET, KEY, make_zip(&valid_entries()), &[("userid", "user-1")]);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_secs(60));
        assert_eq!(Outcome::Failed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        let regex = regex::Regex::new(r"^benchmark template .*bp1-qd.* not found").unwrap();
        let error = record.error.unwrap();
        assert!(regex.is_match(&error), "{error}");
    }

    #[tokio::test]
    async fn missing_user_id_dropped() {
        let store = populated_store(&valid_entries(), &[]);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store.clone(), status.clone(), 1, Duration::from_secs(60));
        assert_eq!(Outcome::Dropped, orchestrator.run(event()).await.unwrap());
        assert_eq!(None, status.get("user-1", FILE_ID).await.unwrap());
        assert!(store
            .object(BUCKET, "public_ds/bp1-qd/mycode_v1/metadata.json")
            .is_none());
    }

    #[tokio::test]
    async fn non_upload_key_dropped() {
        let store = populated_store(&valid_entries(), &[("userid", "user-1")]);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_secs(60));
        let event = TriggerEvent::for_object(&ObjectRef {
            bucket: BUCKET.to_string(),
            key: "public_ds/bp1-qd/mycode_v1/metadata.json".to_string(),
        });
        assert_eq!(Outcome::Dropped, orchestrator.run(event).await.unwrap());
        assert_eq!(None, status.get("user-1", FILE_ID).await.unwrap());
        assert_eq!(None, status.get("user-1", "metadata.json").await.unwrap());
    }

    #[tokio::test]
    async fn timeout_recorded_as_failed() {
        let inner = populated_store(&valid_entries(), &[("userid", "user-1")]);
        let store = Arc::new(FaultyObjectStore {
            inner,
            fault: Fault::Hang,
        });
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_millis(50));
        assert_eq!(Outcome::Failed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        assert_eq!(UploadStatus::Failed, record.status);
        assert!(record.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panic_recorded_as_failed() {
        let inner = populated_store(&valid_entries(), &[("userid", "user-1")]);
        let store = Arc::new(FaultyObjectStore {
            inner,
            fault: Fault::Panic,
        });
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_secs(60));
        assert_eq!(Outcome::Failed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        assert_eq!(UploadStatus::Failed, record.status);
        assert!(record.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn retryable_error_retried() {
        let store = populated_store(&valid_entries(), &[("userid", "user-1")]);
        store.fail_gets_for(KEY, 1);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 2, Duration::from_secs(60));
        assert_eq!(Outcome::Completed, orchestrator.run(event()).await.unwrap());
        let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
        assert_eq!(UploadStatus::Completed, record.status);
    }

    #[tokio::test]
    async fn retries_exhausted() {
        let store = populated_store(&valid_entries(), &[("userid", "user-1")]);
        store.fail_gets_for(KEY, 2);
        let status = Arc::new(temporary_table(3600));
        let orchestrator = orchestrator(store, status.clone(), 2, Duration::from_secs(60));
        assert_eq!(Outcome::Failed, orchestrator.run(event()).await.unwrap());
    }

    #[tokio::test]
    async fn status_ends_terminal() {
        for entries in [
            vec![("slip_v1.dat", "x y value\n0 0 1.0\n")],
            vec![("slip_v1.dat", "x y value\n")],
            vec![("slip_v1.dat", "a b c\n")],
        ] {
            let store = populated_store(&entries, &[("userid", "user-1")]);
            let status = Arc::new(temporary_table(3600));
            let orchestrator = orchestrator(store, status.clone(), 1, Duration::from_secs(60));
            let outcome = orchestrator.run(event()).await.unwrap();
            let record = status.get("user-1", FILE_ID).await.unwrap().unwrap();
            match outcome {
                Outcome::Completed => assert_eq!(UploadStatus::Completed, record.status),
                Outcome::Failed => assert_eq!(UploadStatus::Failed, record.status),
                Outcome::Dropped => panic!("unexpected drop"),
            }
            // A late failure cannot overwrite the terminal state.
            assert!(!status
                .finish("user-1", FILE_ID, Terminal::Failed("late".to_string()))
                .await
                .unwrap());
        }
    }

    #[test]
    fn uploads_filtered() {
        let event: TriggerEvent = serde_json::from_value(serde_json::json!({
            "Records": [
                {"s3": {"bucket": {"name": "b"}, "object": {"key": "upload/bp1-qd/a_v1.zip"}}},
                {"s3": {"bucket": {"name": "b"}, "object": {"key": "public_ds/x.parquet"}}},
            ]
        }))
        .unwrap();
        let uploads = Orchestrator::uploads(&event);
        assert_eq!(1, uploads.len());
        assert_eq!("upload/bp1-qd/a_v1.zip", uploads[0].key);
    }
}
