//! Error handling.
//!
//! Two layers of error are distinguished:
//!
//! * [IngestError] is fatal for the unit of work it occurs in. During ingestion it aborts the
//!   upload and is recorded against the upload's status record. In the HTTP API it is rendered as
//!   a JSON error response.
//! * [FileRejection] is a recoverable, per-file condition. The file is skipped with a warning and
//!   processing of the remaining files continues.
//!
//! [FileError] is returned by per-file processing and carries one or the other, so that only
//! genuinely fatal errors ever propagate out of the per-file loop.

use arrow::error::ArrowError;
use aws_sdk_dynamodb::operation::get_item::GetItemError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use parquet::errors::ParquetError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

/// Ingestion service error type
///
/// This type encapsulates the various fatal errors that may occur.
/// Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Uploaded archive exceeds the configured size limit
    #[error("archive size {size} bytes exceeds limit of {limit} bytes")]
    ArchiveTooLarge { size: u64, limit: u64 },

    /// Error reading an entry from an archive
    #[error("failed to read archive entry {name}")]
    ArchiveEntryRead {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// An archive entry decompresses to more than the configured limit
    #[error("archive entry {name} exceeds limit of {limit} bytes")]
    ArchiveEntryTooLarge { name: String, limit: u64 },

    /// Uploaded archive could not be decoded
    #[error("uploaded archive is not readable")]
    ArchiveUnreadable(#[from] zip::result::ZipError),

    /// Error building columnar data
    #[error("failed to build columnar data")]
    Arrow(#[from] ArrowError),

    /// Error reading from the status table
    #[error("error reading upload status from DynamoDB")]
    DynamoGetItem(#[from] SdkError<GetItemError>),

    /// Error writing to the status table
    #[error("error writing upload status to DynamoDB")]
    DynamoPutItem(#[from] SdkError<PutItemError>),

    /// Error updating the status table
    #[error("error updating upload status in DynamoDB")]
    DynamoUpdateItem(#[from] SdkError<UpdateItemError>),

    /// A gridded file contained no samples to interpolate from
    #[error("cannot regrid {file}: no input points")]
    EmptyInput { file: String },

    /// A gridded table lacks one of its coordinate columns
    #[error("cannot regrid {file}: missing coordinate column {column}")]
    GridColumnMissing { file: String, column: String },

    /// Object key does not follow the upload naming convention
    #[error("invalid upload key {key}: expected upload/{{benchmark_id}}/{{code_name}}_{{version}}.zip")]
    InvalidUploadKey { key: String },

    /// Error (de)serialising JSON
    #[error("failed to (de)serialise JSON")]
    Json(#[from] serde_json::Error),

    /// Status lookup requested without both identifiers
    #[error("Missing required query parameters: userId and fileId")]
    MissingQueryParameters,

    /// Uploaded object carries no user id in its metadata
    #[error("object {bucket}/{key} has no userid metadata")]
    MissingUserId { bucket: String, key: String },

    /// Object does not exist in object storage
    #[error("object {bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },

    /// Error encoding or decoding Parquet data
    #[error("failed to encode or decode Parquet data")]
    Parquet(#[from] ParquetError),

    /// Processing of an upload exceeded its time budget
    #[error("processing timed out after {seconds} seconds")]
    ProcessingTimeout { seconds: u64 },

    /// Error deserialising request data
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error deserialising query parameters
    #[error("request query is not valid")]
    RequestQueryRejection(#[from] QueryRejection),

    /// Error validating request data
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Error while retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Error while retrieving object metadata from S3
    #[error("error retrieving object metadata from S3 storage")]
    S3HeadObject(#[from] SdkError<HeadObjectError>),

    /// Error while listing objects in S3
    #[error("error listing objects in S3 storage")]
    S3ListObjects(#[from] SdkError<ListObjectsV2Error>),

    /// Error while uploading an object to S3
    #[error("error uploading object to S3 storage")]
    S3PutObject(#[from] SdkError<PutObjectError>),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error creating an ndarray from a shape
    #[error("failed to create table from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error using the embedded status database
    #[error("status database error")]
    Sled(#[from] sled::Error),

    /// A stored status record could not be interpreted
    #[error("invalid status record: {reason}")]
    StatusRecordInvalid { reason: String },

    /// A spawned task panicked or was cancelled
    #[error("processing task failed")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Benchmark template exists but is not usable
    #[error("benchmark template {benchmark_id} is invalid: {reason}")]
    TemplateInvalid {
        benchmark_id: String,
        reason: String,
    },

    /// No template exists for the benchmark
    #[error("benchmark template {benchmark_id} not found")]
    TemplateNotFound { benchmark_id: String },

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl IngestError {
    /// Returns whether the error is a transient infrastructure failure that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::DynamoGetItem(_)
                | IngestError::DynamoPutItem(_)
                | IngestError::DynamoUpdateItem(_)
                | IngestError::S3ByteStream(_)
                | IngestError::S3GetObject(_)
                | IngestError::S3HeadObject(_)
                | IngestError::S3ListObjects(_)
                | IngestError::S3PutObject(_)
        )
    }

    /// Render the error and its chain of causes as a single line.
    ///
    /// This is the form stored against a failed upload's status record.
    pub fn to_detail_string(&self) -> String {
        let mut detail = self.to_string();
        let mut current = self.source();
        while let Some(source) = current {
            let cause = source.to_string();
            if !detail.ends_with(&cause) {
                detail.push_str(": ");
                detail.push_str(&cause);
            }
            current = source.source();
        }
        detail
    }
}

/// A recoverable reason for skipping a single data file.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FileRejection {
    /// File contents are not text
    #[error("file is not valid UTF-8 text")]
    NotUtf8,

    /// No column header row before the end of the file
    #[error("no column header row found")]
    MissingHeader,

    /// Column names do not match the template
    #[error("columns {found:?} do not match expected {expected:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// A data row could not be parsed
    #[error("line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
}

/// Outcome of a failed attempt to process one data file.
#[derive(Debug, Error)]
pub enum FileError {
    /// Skip this file and continue with the rest of the upload
    #[error("skipping file: {0}")]
    Skip(#[from] FileRejection),

    /// Abort the whole upload
    #[error(transparent)]
    Abort(#[from] IngestError),
}

impl IntoResponse for IngestError {
    /// Convert from an `IngestError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    /// Return a 400 bad request ErrorResponse
    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Return a 401 unauthorised ErrorResponse
    fn unauthorised<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::UNAUTHORIZED, error)
    }

    /// Return a 404 not found ErrorResponse
    fn not_found<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    /// Return a 500 internal server error ErrorResponse
    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<IngestError> for ErrorResponse {
    /// Convert from an `IngestError` into an `ErrorResponse`.
    fn from(error: IngestError) -> Self {
        let response = match &error {
            // Bad request
            IngestError::ArchiveTooLarge { .. }
            | IngestError::ArchiveEntryTooLarge { .. }
            | IngestError::ArchiveUnreadable(_)
            | IngestError::InvalidUploadKey { .. }
            | IngestError::MissingQueryParameters
            | IngestError::MissingUserId { .. }
            | IngestError::RequestDataJsonRejection(_)
            | IngestError::RequestQueryRejection(_)
            | IngestError::RequestDataValidation(_)
            | IngestError::TemplateInvalid { .. } => Self::bad_request(&error),

            // Not found
            IngestError::ObjectNotFound { .. } | IngestError::TemplateNotFound { .. } => {
                Self::not_found(&error)
            }

            // Internal server error
            IngestError::ArchiveEntryRead { .. }
            | IngestError::Arrow(_)
            | IngestError::DynamoGetItem(_)
            | IngestError::DynamoPutItem(_)
            | IngestError::DynamoUpdateItem(_)
            | IngestError::EmptyInput { .. }
            | IngestError::GridColumnMissing { .. }
            | IngestError::Json(_)
            | IngestError::Parquet(_)
            | IngestError::ProcessingTimeout { .. }
            | IngestError::S3ByteStream(_)
            | IngestError::S3HeadObject(_)
            | IngestError::S3ListObjects(_)
            | IngestError::S3PutObject(_)
            | IngestError::SemaphoreAcquireError(_)
            | IngestError::ShapeInvalid(_)
            | IngestError::Sled(_)
            | IngestError::StatusRecordInvalid { .. }
            | IngestError::TaskFailed(_)
            | IngestError::TryFromInt(_) => Self::internal_server_error(&error),

            IngestError::S3GetObject(sdk_error) => {
                // Tailor the response based on the specific SdkError variant.
                match &sdk_error {
                    SdkError::ServiceError(get_obj_error) => {
                        let get_obj_error = get_obj_error.err();
                        match get_obj_error {
                            GetObjectError::InvalidObjectState(_)
                            | GetObjectError::NoSuchKey(_) => Self::not_found(&error),

                            // Quite a lot of error cases end up as unhandled. Attempt to determine
                            // the error from the code.
                            _ => match get_obj_error.code() {
                                Some("NoSuchBucket") => Self::not_found(&error),

                                Some("InvalidAccessKeyId")
                                | Some("SignatureDoesNotMatch")
                                | Some("AccessDenied") => Self::unauthorised(&error),

                                _ => Self::internal_server_error(&error),
                            },
                        }
                    }

                    _ => Self::internal_server_error(&error),
                }
            }
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
