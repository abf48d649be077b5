//! The ingestion unit of work for one uploaded archive.
//!
//! An upload is processed as follows:
//!
//! 1. The benchmark template named by the upload key is loaded.
//! 2. The archive is downloaded and opened.
//! 3. For each file spec in the template, every matching archive entry is
//!    * scanned for header metadata,
//!    * parsed and validated against the spec's variables,
//!    * regridded if the spec has a grid,
//!    * published as Parquet.
//! 4. The upload's metadata document is published.
//!
//! Rejected files are skipped and listed in the metadata document. Any other error aborts the
//! upload.

use crate::archive::Archive;
use crate::cli::CommandLineArgs;
use crate::columnar::{write_table, PARQUET_EXTENSION};
use crate::error::{FileError, FileRejection, IngestError};
use crate::header::extract_header;
use crate::metadata::{write_metadata, SkippedFile, UploadMetadata, METADATA_FILE_NAME};
use crate::metrics::record_data_file;
use crate::models::{FileSpec, ObjectRef, UploadKey};
use crate::object_store::{base_name, ObjectMetadata, SharedObjectStore};
use crate::regrid::{regrid, RegridConfig};
use crate::resource_manager::ResourceManager;
use crate::table::{parse_and_validate, Table};
use crate::template::TemplateRegistry;

use bytes::Bytes;
use std::sync::Arc;

/// Object user metadata key holding the uploading user's id.
pub const USER_ID_METADATA_KEY: &str = "userid";

/// Tunable parameters of the ingestion pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Bucket holding templates and processed outputs
    pub data_bucket: String,
    /// Largest archive accepted, in bytes
    pub max_archive_size: u64,
    /// Largest uncompressed archive entry accepted, in bytes
    pub max_entry_size: u64,
    /// Regridding parameters
    pub regrid: RegridConfig,
    /// Whether to run CPU-bound work on the Rayon thread pool
    pub use_rayon: bool,
}

impl PipelineConfig {
    /// Returns a PipelineConfig built from command line arguments.
    pub fn new(args: &CommandLineArgs) -> Self {
        PipelineConfig {
            data_bucket: args.data_bucket.clone(),
            max_archive_size: args.max_archive_size,
            max_entry_size: args.max_entry_size,
            regrid: RegridConfig {
                k: args.regrid_neighbours as usize,
                power: args.regrid_power,
            },
            use_rayon: args.use_rayon,
        }
    }
}

/// Everything needed to process uploads. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    store: SharedObjectStore,
    templates: Arc<TemplateRegistry>,
    resource_manager: Arc<ResourceManager>,
    config: Arc<PipelineConfig>,
}

/// Returns a file name without its final extension.
pub fn file_stem(name: &str) -> &str {
    let name = base_name(name);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Parse, validate and optionally regrid one file's contents.
fn transform(
    text: &str,
    spec: &FileSpec,
    regrid_config: &RegridConfig,
    name: &str,
) -> Result<Table, FileError> {
    let table = parse_and_validate(text, &spec.var_list)?;
    match &spec.grid {
        Some(grid) => Ok(regrid(&table, grid, regrid_config, name)?),
        None => Ok(table),
    }
}

impl Pipeline {
    /// Return a new Pipeline.
    pub fn new(
        store: SharedObjectStore,
        templates: Arc<TemplateRegistry>,
        resource_manager: Arc<ResourceManager>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            store,
            templates,
            resource_manager,
            config: Arc::new(config),
        }
    }

    /// Returns the object store used by this pipeline.
    pub fn store(&self) -> &SharedObjectStore {
        &self.store
    }

    /// Process one uploaded archive, publishing its tables and metadata document.
    ///
    /// # Arguments
    ///
    /// * `upload`: Location of the uploaded archive
    /// * `user_id`: Id of the uploading user, attached to every published object
    #[tracing::instrument(level = "info", skip(self), fields(bucket = %upload.bucket, key = %upload.key))]
    pub async fn process_upload(
        &self,
        upload: &ObjectRef,
        user_id: &str,
    ) -> Result<UploadMetadata, IngestError> {
        let upload_key = UploadKey::parse(&upload.key)?;
        let bucket = &self.config.data_bucket;
        let template = self
            .templates
            .get(self.store.as_ref(), bucket, &upload_key.benchmark_id)
            .await?;

        let data = {
            let _conn = self.resource_manager.s3_connection().await?;
            self.store
                .get(
                    &upload.bucket,
                    &upload.key,
                    Some(self.config.max_archive_size),
                )
                .await?
        };
        let mut archive = Archive::open(data, self.config.max_entry_size)?;

        let prefix = upload_key.output_prefix();
        let metadata = ObjectMetadata::from([(
            USER_ID_METADATA_KEY.to_string(),
            user_id.to_string(),
        )]);
        let mut document = UploadMetadata::default();

        for spec in &template.files {
            let entries = archive.matching_entries(spec);
            if entries.is_empty() {
                tracing::info!(prefix = %spec.prefix, "no files match template entry");
            }
            for entry in entries {
                let contents = archive.read_entry(&entry)?;
                match self
                    .process_file(&mut document, spec, &entry, contents, &prefix, &metadata)
                    .await
                {
                    Ok(()) => {
                        record_data_file("processed");
                        document.processed_files.push(entry);
                    }
                    Err(FileError::Skip(rejection)) => {
                        tracing::warn!(file = %entry, "skipping file: {}", rejection);
                        record_data_file("skipped");
                        document.skipped_files.push(SkippedFile {
                            file: entry,
                            reason: rejection.to_string(),
                        });
                    }
                    Err(FileError::Abort(err)) => return Err(err),
                }
            }
        }

        let _conn = self.resource_manager.s3_connection().await?;
        write_metadata(
            self.store.as_ref(),
            bucket,
            &document,
            &format!("{prefix}{METADATA_FILE_NAME}"),
            &metadata,
        )
        .await?;
        tracing::info!(
            processed = document.processed_files.len(),
            skipped = document.skipped_files.len(),
            "processed upload"
        );
        Ok(document)
    }

    /// Process a single archive entry.
    async fn process_file(
        &self,
        document: &mut UploadMetadata,
        spec: &FileSpec,
        entry: &str,
        contents: Bytes,
        prefix: &str,
        metadata: &ObjectMetadata,
    ) -> Result<(), FileError> {
        let text = String::from_utf8(contents.to_vec()).map_err(|_| FileRejection::NotUtf8)?;
        extract_header(&mut document.common_header, &spec.prefix, &text);

        let table = if self.config.use_rayon {
            let spec = spec.clone();
            let regrid_config = self.config.regrid;
            let name = entry.to_string();
            tokio_rayon::spawn(move || transform(&text, &spec, &regrid_config, &name)).await?
        } else {
            let _task = self.resource_manager.task().await?;
            transform(&text, spec, &self.config.regrid, entry)?
        };

        let key = format!("{prefix}{}.{PARQUET_EXTENSION}", file_stem(entry));
        let _conn = self.resource_manager.s3_connection().await?;
        write_table(
            self.store.as_ref(),
            &self.config.data_bucket,
            &table,
            &key,
            metadata,
        )
        .await?;
        Ok(())
    }
}
