//! Data types and associated functions and methods

use crate::error::IngestError;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Prefix under which users upload archives.
pub const UPLOAD_PREFIX: &str = "upload/";

/// Prefix under which benchmark templates are stored.
pub const TEMPLATE_PREFIX: &str = "benchmark_templates/";

/// Prefix under which processed datasets are published.
pub const PUBLIC_PREFIX: &str = "public_ds/";

/// Declarative schema of the files expected for a benchmark.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct BenchmarkTemplate {
    /// Benchmark identifier, e.g. `bp1-qd`
    #[serde(default)]
    pub benchmark_id: String,
    /// Expected files, in processing order
    #[validate]
    #[validate(length(min = 1, message = "template must describe at least one file"))]
    pub files: Vec<FileSpec>,
}

/// Describes one kind of file within an upload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[validate(schema(function = "validate_file_spec"))]
pub struct FileSpec {
    /// Base file names must start with this prefix
    #[validate(length(min = 1, message = "prefix must not be empty"))]
    pub prefix: String,
    /// Base file names must end with this extension
    #[validate(length(min = 1, message = "file_type must not be empty"))]
    pub file_type: String,
    /// Expected columns, in order
    #[validate(length(min = 1, message = "var_list must not be empty"))]
    pub var_list: Vec<VarDef>,
    /// Optional regular lattice to regrid onto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate]
    pub grid: Option<GridSpec>,
}

impl FileSpec {
    /// Returns the file extension without any leading dot.
    pub fn extension(&self) -> &str {
        self.file_type.trim_start_matches('.')
    }

    /// Returns whether a base file name belongs to this spec.
    pub fn matches(&self, base_name: &str) -> bool {
        base_name.starts_with(&self.prefix)
            && base_name
                .strip_suffix(self.extension())
                .is_some_and(|rest| rest.ends_with('.'))
    }

    /// Returns the expected column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.var_list.iter().map(|var| var.name.as_str()).collect()
    }
}

/// A single expected column.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VarDef {
    /// Column name, matched case-insensitively
    pub name: String,
    /// Physical unit
    #[serde(default)]
    pub unit: String,
    /// Human readable description
    #[serde(default)]
    pub description: String,
}

impl VarDef {
    /// Return a new VarDef with empty unit and description.
    #[allow(dead_code)]
    pub fn new(name: &str) -> Self {
        VarDef {
            name: name.to_string(),
            unit: String::new(),
            description: String::new(),
        }
    }
}

/// A regular target lattice of `x.n * y.n` points.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct GridSpec {
    #[validate]
    pub x: AxisSpec,
    #[validate]
    pub y: AxisSpec,
}

/// One axis of a [GridSpec].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[validate(schema(function = "validate_axis"))]
pub struct AxisSpec {
    pub min: f64,
    pub max: f64,
    #[validate(range(min = 1, message = "n must be greater than 0"))]
    pub n: usize,
}

impl AxisSpec {
    /// Return a new AxisSpec object.
    #[allow(dead_code)]
    pub fn new(min: f64, max: f64, n: usize) -> Self {
        AxisSpec { min, max, n }
    }

    /// Returns `n` evenly spaced values over `[min, max]`, both ends included.
    pub fn values(&self) -> Vec<f64> {
        if self.n == 1 {
            return vec![self.min];
        }
        let step = (self.max - self.min) / (self.n - 1) as f64;
        (0..self.n)
            .map(|i| {
                if i == self.n - 1 {
                    self.max
                } else {
                    self.min + step * i as f64
                }
            })
            .collect()
    }
}

/// Validate an axis
fn validate_axis(axis: &AxisSpec) -> Result<(), ValidationError> {
    if !axis.min.is_finite() || !axis.max.is_finite() {
        return Err(ValidationError::new("axis bounds must be finite"));
    }
    if axis.min > axis.max {
        let mut error = ValidationError::new("axis min must not be greater than max");
        error.add_param("min".into(), &axis.min);
        error.add_param("max".into(), &axis.max);
        return Err(error);
    }
    Ok(())
}

/// Validate the variables of a file spec
fn validate_file_spec(spec: &FileSpec) -> Result<(), ValidationError> {
    let mut names: Vec<String> = spec
        .var_list
        .iter()
        .map(|var| var.name.to_lowercase())
        .collect();
    if names.iter().any(|name| name.is_empty()) {
        return Err(ValidationError::new("variable names must not be empty"));
    }
    names.sort();
    let total = names.len();
    names.dedup();
    if names.len() != total {
        return Err(ValidationError::new("variable names must be unique"));
    }
    if spec.grid.is_some() {
        let has = |name: &str| names.iter().any(|n| n == name);
        if !has("x") || !has("y") {
            return Err(ValidationError::new(
                "gridded files must have x and y variables",
            ));
        }
        if names.len() < 3 {
            return Err(ValidationError::new(
                "gridded files must have at least one variable besides x and y",
            ));
        }
    }
    Ok(())
}

/// Lifecycle state of an upload.
#[derive(Clone, Copy, Debug, Deserialize, strum_macros::Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UploadStatus {
    Processing,
    Completed,
    Failed,
}

/// Persisted processing state of one upload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusRecord {
    pub user_id: String,
    pub file_id: String,
    pub status: UploadStatus,
    /// RFC 3339 UTC time of the last transition
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Expiry time in seconds since the Unix epoch
    pub expires_at: i64,
}

/// Location of an uploaded object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// Identity of an upload derived from its object key.
///
/// Keys take the form `upload/{benchmark_id}/{code_name}_{version}.zip`.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadKey {
    pub benchmark_id: String,
    pub code_name: String,
    pub version: String,
    /// Base name of the uploaded object, used as the status record's file id
    pub file_id: String,
}

impl UploadKey {
    /// Parse an object key.
    pub fn parse(key: &str) -> Result<Self, IngestError> {
        let invalid = || IngestError::InvalidUploadKey {
            key: key.to_string(),
        };
        let rest = key.strip_prefix(UPLOAD_PREFIX).ok_or_else(invalid)?;
        let (benchmark_id, file_id) = rest.split_once('/').ok_or_else(invalid)?;
        if benchmark_id.is_empty() || file_id.contains('/') {
            return Err(invalid());
        }
        let stem = file_id.strip_suffix(".zip").ok_or_else(invalid)?;
        let (code_name, version) = stem.split_once('_').ok_or_else(invalid)?;
        if code_name.is_empty() || version.is_empty() {
            return Err(invalid());
        }
        Ok(UploadKey {
            benchmark_id: benchmark_id.to_string(),
            code_name: code_name.to_string(),
            version: version.to_string(),
            file_id: file_id.to_string(),
        })
    }

    /// Returns the output prefix shared by every object produced from this upload.
    pub fn output_prefix(&self) -> String {
        format!(
            "{}{}/{}_{}/",
            PUBLIC_PREFIX, self.benchmark_id, self.code_name, self.version
        )
    }
}

/// Returns the object key of a benchmark's template.
pub fn template_key(benchmark_id: &str) -> String {
    format!("{}{}.json", TEMPLATE_PREFIX, benchmark_id)
}

/// Bucket reference within an S3 event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BucketDetail {
    pub name: String,
}

/// Object reference within an S3 event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ObjectDetail {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The `detail` of an EventBridge "Object Created" event.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct S3EventDetail {
    pub bucket: BucketDetail,
    pub object: ObjectDetail,
}

/// One record of an S3 bucket notification.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct S3NotificationRecord {
    pub s3: S3EventDetail,
}

/// Object-created trigger event.
///
/// Both the EventBridge form and the classic S3 bucket notification form are accepted.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TriggerEvent {
    EventBridge {
        #[serde(rename = "detail-type", default)]
        detail_type: Option<String>,
        detail: S3EventDetail,
    },
    Notification {
        #[serde(rename = "Records")]
        records: Vec<S3NotificationRecord>,
    },
}

impl TriggerEvent {
    /// Returns the uploaded objects referenced by this event.
    ///
    /// Notification keys are URL-encoded and are decoded here.
    pub fn objects(&self) -> Vec<ObjectRef> {
        match self {
            TriggerEvent::EventBridge { detail, .. } => vec![ObjectRef {
                bucket: detail.bucket.name.clone(),
                key: detail.object.key.clone(),
            }],
            TriggerEvent::Notification { records } => records
                .iter()
                .map(|record| ObjectRef {
                    bucket: record.s3.bucket.name.clone(),
                    key: decode_notification_key(&record.s3.object.key),
                })
                .collect(),
        }
    }

    /// Returns an EventBridge event for a single object.
    pub fn for_object(object: &ObjectRef) -> Self {
        TriggerEvent::EventBridge {
            detail_type: Some("Object Created".to_string()),
            detail: S3EventDetail {
                bucket: BucketDetail {
                    name: object.bucket.clone(),
                },
                object: ObjectDetail {
                    key: object.key.clone(),
                    size: None,
                },
            },
        }
    }
}

/// Decode a form-encoded S3 notification key (`+` for space, `%XX` escapes).
fn decode_notification_key(key: &str) -> String {
    // S3 escapes '&' and '=', so the whole key parses as a single name.
    url::form_urlencoded::parse(key.as_bytes())
        .next()
        .map(|(name, _)| name.into_owned())
        .unwrap_or_default()
}
