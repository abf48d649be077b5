//! Upload status tracking.
//!
//! Each upload has one status record keyed by (user id, file id). A record is created in the
//! `processing` state when processing starts and moves to exactly one of `completed` or `failed`
//! when it ends. Terminal records are not modified again until a new upload with the same key
//! starts.

use crate::error::IngestError;
use crate::models::{UploadStatus, UploadStatusRecord};

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const USER_ID: &str = "userId";
const FILE_ID: &str = "fileId";
const STATUS: &str = "status";
const TIMESTAMP: &str = "timestamp";
const ERROR: &str = "error";
const EXPIRES_AT: &str = "expiresAt";

/// Final state of an upload.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Completed,
    /// Failed with the given error detail
    Failed(String),
}

impl Terminal {
    fn status(&self) -> UploadStatus {
        match self {
            Terminal::Completed => UploadStatus::Completed,
            Terminal::Failed(_) => UploadStatus::Failed,
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            Terminal::Completed => None,
            Terminal::Failed(error) => Some(error),
        }
    }
}

/// Persistent store of upload status records.
#[async_trait]
pub trait StatusTable: Send + Sync {
    /// Record that processing of an upload has started, replacing any existing record.
    async fn start(&self, user_id: &str, file_id: &str) -> Result<(), IngestError>;

    /// Record the final state of an upload.
    ///
    /// Only applies if the upload is currently `processing`. Returns whether the record changed.
    async fn finish(
        &self,
        user_id: &str,
        file_id: &str,
        outcome: Terminal,
    ) -> Result<bool, IngestError>;

    /// Returns the record of an upload, if there is an unexpired one.
    async fn get(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<UploadStatusRecord>, IngestError>;
}

/// StatusTable wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedStatusTable = Arc<dyn StatusTable>;

/// Returns the current time as an RFC 3339 string and as seconds since the Unix epoch.
fn now() -> Result<(String, i64), IngestError> {
    let now = OffsetDateTime::now_utc();
    let timestamp = now
        .format(&Rfc3339)
        .map_err(|err| IngestError::StatusRecordInvalid {
            reason: err.to_string(),
        })?;
    Ok((timestamp, now.unix_timestamp()))
}

fn parse_status(status: &str) -> Result<UploadStatus, IngestError> {
    match status {
        "processing" => Ok(UploadStatus::Processing),
        "completed" => Ok(UploadStatus::Completed),
        "failed" => Ok(UploadStatus::Failed),
        other => Err(IngestError::StatusRecordInvalid {
            reason: format!("unknown status {other:?}"),
        }),
    }
}

/// Status table held in Amazon DynamoDB.
///
/// The table has partition key `userId` and sort key `fileId`, with `expiresAt` configured as
/// its time-to-live attribute.
pub struct DynamoStatusTable {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
    ttl_seconds: i64,
}

impl DynamoStatusTable {
    /// Return a new DynamoStatusTable.
    ///
    /// # Arguments
    ///
    /// * `config`: AWS SDK configuration
    /// * `table_name`: Name of the table
    /// * `ttl_seconds`: Lifespan of records
    pub fn new(config: &aws_config::SdkConfig, table_name: &str, ttl_seconds: i64) -> Self {
        Self {
            client: aws_sdk_dynamodb::Client::new(config),
            table_name: table_name.to_string(),
            ttl_seconds,
        }
    }

    fn key(user_id: &str, file_id: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (USER_ID.to_string(), AttributeValue::S(user_id.to_string())),
            (FILE_ID.to_string(), AttributeValue::S(file_id.to_string())),
        ])
    }
}

fn string_attribute(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<String, IngestError> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| IngestError::StatusRecordInvalid {
            reason: format!("missing string attribute {name}"),
        })
}

/// Convert a DynamoDB item into a status record.
fn record_from_item(item: &HashMap<String, AttributeValue>) -> Result<UploadStatusRecord, IngestError> {
    let expires_at = item
        .get(EXPIRES_AT)
        .and_then(|value| value.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .unwrap_or(i64::MAX);
    Ok(UploadStatusRecord {
        user_id: string_attribute(item, USER_ID)?,
        file_id: string_attribute(item, FILE_ID)?,
        status: parse_status(&string_attribute(item, STATUS)?)?,
        timestamp: string_attribute(item, TIMESTAMP)?,
        error: item
            .get(ERROR)
            .and_then(|value| value.as_s().ok())
            .cloned(),
        expires_at,
    })
}

#[async_trait]
impl StatusTable for DynamoStatusTable {
    async fn start(&self, user_id: &str, file_id: &str) -> Result<(), IngestError> {
        let (timestamp, now) = now()?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::key(user_id, file_id)))
            .item(STATUS, AttributeValue::S(UploadStatus::Processing.to_string()))
            .item(TIMESTAMP, AttributeValue::S(timestamp))
            .item(
                EXPIRES_AT,
                AttributeValue::N((now + self.ttl_seconds).to_string()),
            )
            .send()
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        user_id: &str,
        file_id: &str,
        outcome: Terminal,
    ) -> Result<bool, IngestError> {
        let (timestamp, now) = now()?;
        let mut request = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(user_id, file_id)))
            .condition_expression("#s = :processing")
            .expression_attribute_names("#s", STATUS)
            .expression_attribute_names("#t", TIMESTAMP)
            .expression_attribute_names("#x", EXPIRES_AT)
            .expression_attribute_names("#e", ERROR)
            .expression_attribute_values(
                ":processing",
                AttributeValue::S(UploadStatus::Processing.to_string()),
            )
            .expression_attribute_values(":status", AttributeValue::S(outcome.status().to_string()))
            .expression_attribute_values(":timestamp", AttributeValue::S(timestamp))
            .expression_attribute_values(
                ":expires",
                AttributeValue::N((now + self.ttl_seconds).to_string()),
            );
        request = match outcome.error() {
            Some(error) => request
                .update_expression("SET #s = :status, #t = :timestamp, #x = :expires, #e = :error")
                .expression_attribute_values(":error", AttributeValue::S(error.to_string())),
            None => request.update_expression("SET #s = :status, #t = :timestamp, #x = :expires REMOVE #e"),
        };
        match request.send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|err| err.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<UploadStatusRecord>, IngestError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key(user_id, file_id)))
            .consistent_read(true)
            .send()
            .await?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        let record = record_from_item(item)?;
        // Expired items may linger until DynamoDB removes them.
        let (_, now) = now()?;
        Ok((record.expires_at > now).then_some(record))
    }
}

/// Status table held in an embedded sled database.
pub struct SledStatusTable {
    tree: sled::Tree,
    ttl_seconds: i64,
}

impl SledStatusTable {
    /// Open or create the status table in the database at `path`.
    pub fn open(path: &str, ttl_seconds: i64) -> Result<Self, IngestError> {
        let path = expanduser::expanduser(path).map_err(|err| IngestError::StatusRecordInvalid {
            reason: format!("invalid status path {path}: {err}"),
        })?;
        let db = sled::open(path)?;
        Self::new(&db, ttl_seconds)
    }

    /// Return a new SledStatusTable using a tree of `db`.
    pub fn new(db: &sled::Db, ttl_seconds: i64) -> Result<Self, IngestError> {
        Ok(Self {
            tree: db.open_tree("upload_status")?,
            ttl_seconds,
        })
    }

    fn key(user_id: &str, file_id: &str) -> Vec<u8> {
        [user_id.as_bytes(), &[0], file_id.as_bytes()].concat()
    }

    fn record(
        &self,
        user_id: &str,
        file_id: &str,
        status: UploadStatus,
        error: Option<&str>,
    ) -> Result<UploadStatusRecord, IngestError> {
        let (timestamp, now) = now()?;
        Ok(UploadStatusRecord {
            user_id: user_id.to_string(),
            file_id: file_id.to_string(),
            status,
            timestamp,
            error: error.map(str::to_string),
            expires_at: now + self.ttl_seconds,
        })
    }
}

#[async_trait]
impl StatusTable for SledStatusTable {
    async fn start(&self, user_id: &str, file_id: &str) -> Result<(), IngestError> {
        let record = self.record(user_id, file_id, UploadStatus::Processing, None)?;
        self.tree
            .insert(Self::key(user_id, file_id), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn finish(
        &self,
        user_id: &str,
        file_id: &str,
        outcome: Terminal,
    ) -> Result<bool, IngestError> {
        let key = Self::key(user_id, file_id);
        loop {
            let Some(current) = self.tree.get(&key)? else {
                return Ok(false);
            };
            let record: UploadStatusRecord = serde_json::from_slice(&current)?;
            if record.status != UploadStatus::Processing {
                return Ok(false);
            }
            let updated = self.record(user_id, file_id, outcome.status(), outcome.error())?;
            let swapped = self.tree.compare_and_swap(
                &key,
                Some(current),
                Some(serde_json::to_vec(&updated)?),
            )?;
            if swapped.is_ok() {
                return Ok(true);
            }
            // Lost a race with a concurrent writer; re-read and try again.
        }
    }

    async fn get(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<UploadStatusRecord>, IngestError> {
        let key = Self::key(user_id, file_id);
        let Some(value) = self.tree.get(&key)? else {
            return Ok(None);
        };
        let record: UploadStatusRecord = serde_json::from_slice(&value)?;
        let (_, now) = now()?;
        if record.expires_at <= now {
            // A concurrent restart may have replaced the record; leave it in place if so.
            let _ = self
                .tree
                .compare_and_swap(&key, Some(value), None as Option<&[u8]>)?;
            return Ok(None);
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temporary_table(ttl_seconds: i64) -> SledStatusTable {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledStatusTable::new(&db, ttl_seconds).unwrap()
    }

    #[tokio::test]
    async fn start_and_get() {
        let table = temporary_table(3600);
        assert_eq!(None, table.get("u", "f.zip").await.unwrap());
        table.start("u", "f.zip").await.unwrap();
        let record = table.get("u", "f.zip").await.unwrap().unwrap();
        assert_eq!("u", record.user_id);
        assert_eq!("f.zip", record.file_id);
        assert_eq!(UploadStatus::Processing, record.status);
        assert_eq!(None, record.error);
        assert!(OffsetDateTime::parse(&record.timestamp, &Rfc3339).is_ok());
    }

    #[tokio::test]
    async fn completed_is_terminal() {
        let table = temporary_table(3600);
        table.start("u", "f.zip").await.unwrap();
        assert!(table.finish("u", "f.zip", Terminal::Completed).await.unwrap());
        assert!(!table
            .finish("u", "f.zip", Terminal::Failed("late".to_string()))
            .await
            .unwrap());
        let record = table.get("u", "f.zip").await.unwrap().unwrap();
        assert_eq!(UploadStatus::Completed, record.status);
        assert_eq!(None, record.error);
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let table = temporary_table(3600);
        table.start("u", "f.zip").await.unwrap();
        assert!(table
            .finish("u", "f.zip", Terminal::Failed("boom".to_string()))
            .await
            .unwrap());
        assert!(!table.finish("u", "f.zip", Terminal::Completed).await.unwrap());
        let record = table.get("u", "f.zip").await.unwrap().unwrap();
        assert_eq!(UploadStatus::Failed, record.status);
        assert_eq!(Some("boom".to_string()), record.error);
    }

    #[tokio::test]
    async fn finish_without_start() {
        let table = temporary_table(3600);
        assert!(!table.finish("u", "f.zip", Terminal::Completed).await.unwrap());
        assert_eq!(None, table.get("u", "f.zip").await.unwrap());
    }

    #[tokio::test]
    async fn restart_overwrites() {
        let table = temporary_table(3600);
        table.start("u", "f.zip").await.unwrap();
        table
            .finish("u", "f.zip", Terminal::Failed("boom".to_string()))
            .await
            .unwrap();
        table.start("u", "f.zip").await.unwrap();
        let record = table.get("u", "f.zip").await.unwrap().unwrap();
        assert_eq!(UploadStatus::Processing, record.status);
        assert_eq!(None, record.error);
    }

    #[tokio::test]
    async fn keys_do_not_collide() {
        let table = temporary_table(3600);
        table.start("ab", "c").await.unwrap();
        assert_eq!(None, table.get("a", "bc").await.unwrap());
        assert_eq!(None, table.get("ab", "d").await.unwrap());
    }

    #[tokio::test]
    async fn expired_records_absent() {
        let table = temporary_table(0);
        table.start("u", "f.zip").await.unwrap();
        assert_eq!(None, table.get("u", "f.zip").await.unwrap());
        assert!(table.tree.is_empty());
    }

    #[test]
    fn dynamo_item_conversion() {
        let item = HashMap::from([
            (USER_ID.to_string(), AttributeValue::S("u".to_string())),
            (FILE_ID.to_string(), AttributeValue::S("f.zip".to_string())),
            (STATUS.to_string(), AttributeValue::S("failed".to_string())),
            (
                TIMESTAMP.to_string(),
                AttributeValue::S("2024-01-01T00:00:00Z".to_string()),
            ),
            (ERROR.to_string(), AttributeValue::S("boom".to_string())),
            (EXPIRES_AT.to_string(), AttributeValue::N("1700000000".to_string())),
        ]);
        let record = record_from_item(&item).unwrap();
        assert_eq!(UploadStatus::Failed, record.status);
        assert_eq!(Some("boom".to_string()), record.error);
        assert_eq!(1700000000, record.expires_at);
    }

    #[test]
    fn dynamo_item_invalid_status() {
        let item = HashMap::from([
            (USER_ID.to_string(), AttributeValue::S("u".to_string())),
            (FILE_ID.to_string(), AttributeValue::S("f.zip".to_string())),
            (STATUS.to_string(), AttributeValue::S("queued".to_string())),
            (TIMESTAMP.to_string(), AttributeValue::S("t".to_string())),
        ]);
        assert!(matches!(
            record_from_item(&item),
            Err(IngestError::StatusRecordInvalid { .. })
        ));
    }
}
