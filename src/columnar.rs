//! Parquet encoding of tables and publishing of the encoded files.

use crate::error::IngestError;
use crate::object_store::{ObjectMetadata, ObjectStore};
use crate::table::Table;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Content type of published Parquet files.
pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// File extension of published Parquet files.
pub const PARQUET_EXTENSION: &str = "parquet";

fn writer_properties(metadata: &ObjectMetadata) -> WriterProperties {
    let sorted: BTreeMap<&String, &String> = metadata.iter().collect();
    let key_values = sorted
        .into_iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(value.clone()),
        })
        .collect::<Vec<_>>();
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata((!key_values.is_empty()).then_some(key_values))
        .build()
}

/// Encode a table as a Parquet file with one non-nullable `Float64` column per table column.
///
/// `metadata` is embedded in the file's key-value metadata.
pub fn encode_table(table: &Table, metadata: &ObjectMetadata) -> Result<Bytes, IngestError> {
    let fields: Vec<Field> = table
        .names()
        .iter()
        .map(|name| Field::new(name, DataType::Float64, false))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let columns: Vec<ArrayRef> = table
        .data()
        .columns()
        .into_iter()
        .map(|column| Arc::new(Float64Array::from_iter_values(column.iter().copied())) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(writer_properties(metadata)))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buf))
}

/// Decode a Parquet file written by [encode_table].
pub fn decode_table(data: &Bytes) -> Result<Table, IngestError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data.clone())?;
    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    for batch in builder.build()? {
        let batch = batch?;
        for (values, array) in columns.iter_mut().zip(batch.columns()) {
            let array = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| {
                    ArrowError::CastError(format!(
                        "expected Float64 column, found {}",
                        array.data_type()
                    ))
                })?;
            values.extend(array.values().iter().copied());
        }
    }
    Table::from_columns(names.into_iter().zip(columns).collect())
}

/// Encode a table and upload it, attaching `metadata` as object user metadata.
///
/// Any existing object at `key` is replaced.
///
/// # Arguments
///
/// * `store`: Object store to publish to
/// * `bucket`: Destination bucket
/// * `table`: Table to publish
/// * `key`: Destination object key
/// * `metadata`: Caller-supplied key-value metadata, e.g. the originating user id
pub async fn write_table(
    store: &dyn ObjectStore,
    bucket: &str,
    table: &Table,
    key: &str,
    metadata: &ObjectMetadata,
) -> Result<(), IngestError> {
    let body = encode_table(table, metadata)?;
    let size = body.len();
    store
        .put(bucket, key, body, PARQUET_CONTENT_TYPE, metadata)
        .await?;
    tracing::debug!(bucket, key, rows = table.nrows(), size, "wrote table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryObjectStore;

    use ndarray::array;
    use parquet::file::reader::{FileReader, SerializedFileReader};

    fn test_table() -> Table {
        Table::new(
            vec!["t".to_string(), "slip".to_string(), "slip_rate".to_string()],
            array![[0.0, 1.0, -2.5e-9], [1.5, 2.0, 3.0e-1], [3.0, f64::MAX, 0.0]],
        )
        .unwrap()
    }

    fn metadata() -> ObjectMetadata {
        ObjectMetadata::from([("userid".to_string(), "user-1".to_string())])
    }

    #[test]
    fn round_trip() {
        let table = test_table();
        let encoded = encode_table(&table, &metadata()).unwrap();
        assert_eq!(table, decode_table(&encoded).unwrap());
    }

    #[test]
    fn empty_table() {
        let table = Table::new(vec!["t".to_string()], ndarray::Array2::zeros((0, 1))).unwrap();
        let encoded = encode_table(&table, &ObjectMetadata::new()).unwrap();
        assert_eq!(table, decode_table(&encoded).unwrap());
    }

    #[test]
    fn schema_and_metadata() {
        let encoded = encode_table(&test_table(), &metadata()).unwrap();
        let reader = SerializedFileReader::new(encoded).unwrap();
        let file_metadata = reader.metadata().file_metadata();
        let key_values = file_metadata.key_value_metadata().unwrap();
        assert!(key_values
            .iter()
            .any(|kv| kv.key == "userid" && kv.value.as_deref() == Some("user-1")));
        let column = reader.metadata().row_group(0).column(0);
        assert_eq!(Compression::SNAPPY, column.compression());
        let builder = ParquetRecordBatchReaderBuilder::try_new(encode_table(&test_table(), &metadata()).unwrap()).unwrap();
        for field in builder.schema().fields() {
            assert_eq!(&DataType::Float64, field.data_type());
            assert!(!field.is_nullable());
        }
    }

    #[test]
    fn not_parquet() {
        let result = decode_table(&Bytes::from_static(b"not parquet"));
        assert!(matches!(result, Err(IngestError::Parquet(_))));
    }

    #[tokio::test]
    async fn write() {
        let store = MemoryObjectStore::new();
        let key = "public_ds/bp1-qd/mycode_v1/fltst_dp000.parquet";
        write_table(&store, "bucket", &test_table(), key, &metadata())
            .await
            .unwrap();
        let object = store.object("bucket", key).unwrap();
        assert_eq!(PARQUET_CONTENT_TYPE, object.content_type);
        assert_eq!(metadata(), object.metadata);
        assert_eq!(test_table(), decode_table(&object.body).unwrap());
        // Writing again overwrites.
        write_table(&store, "bucket", &test_table(), key, &ObjectMetadata::new())
            .await
            .unwrap();
        assert!(store.object("bucket", key).unwrap().metadata.is_empty());
    }
}
