//! Per-upload metadata document.

use crate::error::IngestError;
use crate::header::HeaderDocument;
use crate::object_store::{ObjectMetadata, ObjectStore};

use serde::{Deserialize, Serialize};

/// Name of the metadata document within an upload's output prefix.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// A data file that was not published, and why.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

/// Summary of one processed upload, published beside its data files.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct UploadMetadata {
    /// Leading comment metadata of the first file seen for each prefix
    pub common_header: HeaderDocument,
    /// Archive entry names of published files, in processing order
    pub processed_files: Vec<String>,
    /// Archive entries that matched the template but were rejected
    #[serde(default)]
    pub skipped_files: Vec<SkippedFile>,
}

/// Upload an upload's metadata document as pretty-printed JSON.
///
/// # Arguments
///
/// * `store`: Object store to publish to
/// * `bucket`: Destination bucket
/// * `document`: The metadata document
/// * `key`: Destination object key
/// * `metadata`: Object user metadata
pub async fn write_metadata(
    store: &dyn ObjectStore,
    bucket: &str,
    document: &UploadMetadata,
    key: &str,
    metadata: &ObjectMetadata,
) -> Result<(), IngestError> {
    let body = serde_json::to_vec_pretty(document)?;
    store
        .put(bucket, key, body.into(), mime::APPLICATION_JSON.as_ref(), metadata)
        .await?;
    tracing::debug!(
        bucket,
        key,
        processed = document.processed_files.len(),
        skipped = document.skipped_files.len(),
        "wrote upload metadata"
    );
    Ok(())
}
