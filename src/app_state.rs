use crate::cli::{CommandLineArgs, StatusBackend};
use crate::dataset::DatasetService;
use crate::error::IngestError;
use crate::object_store::{S3ObjectStore, SharedObjectStore};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::resource_manager::ResourceManager;
use crate::status::{DynamoStatusTable, SharedStatusTable, SledStatusTable};
use crate::template::TemplateRegistry;

use aws_config::BehaviorVersion;
use std::sync::Arc;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Upload status records.
    pub status: SharedStatusTable,

    /// Drives uploads through processing.
    pub orchestrator: Orchestrator,

    /// Read access to published datasets.
    pub datasets: DatasetService,
}

impl AppState {
    /// Create and return an [AppState] backed by AWS services.
    ///
    /// Credentials and region are resolved from the environment.
    pub async fn new(args: &CommandLineArgs) -> Result<Self, IngestError> {
        let task_limit = args
            .thread_limit
            .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
        let resource_manager = Arc::new(ResourceManager::new(args.s3_connection_limit, task_limit));
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let store: SharedObjectStore = Arc::new(S3ObjectStore::new(
            &config,
            args.s3_endpoint.as_ref(),
            resource_manager.clone(),
        ));
        let ttl_seconds = i64::try_from(args.status_ttl_days.saturating_mul(SECONDS_PER_DAY))?;
        let status: SharedStatusTable = match args.status_backend {
            StatusBackend::Dynamodb => Arc::new(DynamoStatusTable::new(
                &config,
                &args.status_table,
                ttl_seconds,
            )),
            StatusBackend::Sled => Arc::new(SledStatusTable::open(&args.status_path, ttl_seconds)?),
        };
        tracing::info!(
            "using {:?} status backend and data bucket {}",
            args.status_backend,
            args.data_bucket
        );
        Ok(Self::with_backends(args, resource_manager, store, status))
    }

    /// Create and return an [AppState] using the given object store and status table.
    pub fn with_backends(
        args: &CommandLineArgs,
        resource_manager: Arc<ResourceManager>,
        store: SharedObjectStore,
        status: SharedStatusTable,
    ) -> Self {
        let templates = Arc::new(TemplateRegistry::new(args.template_cache_ttl));
        let pipeline = Pipeline::new(
            store.clone(),
            templates,
            resource_manager,
            PipelineConfig::new(args),
        );
        let orchestrator =
            Orchestrator::new(pipeline, status.clone(), OrchestratorConfig::new(args));
        let datasets = DatasetService::new(
            store,
            &args.data_bucket,
            args.template_cache_ttl,
            args.fetch_concurrency,
        );
        Self {
            args: args.clone(),
            status,
            orchestrator,
            datasets,
        }
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
