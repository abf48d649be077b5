//! This crate provides an ingestion service for earthquake-cycle simulation benchmark results.
//! Modelling groups upload a zip archive of tabular output files per code and version. Each file
//! is validated against the benchmark's template, optionally regridded onto the template's
//! regular lattice, and published as Parquet alongside a JSON metadata document. The progress
//! of every upload is tracked in a status table that clients can poll.
//!
//! The service is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, serving the trigger, status and
//!   dataset query endpoints.
//! * [Serde](serde) performs (de)serialisation of JSON templates, events and responses.
//! * [AWS SDK for S3](aws-sdk-s3) and [DynamoDB](aws-sdk-dynamodb) store uploads, outputs and
//!   status records. An embedded [sled] database may hold status records instead.
//! * [ndarray] holds tables of numeric data, and [rstar] finds nearest neighbours when
//!   regridding.
//! * [Arrow](arrow) and [Parquet](parquet) encode published tables.

pub mod app;
pub mod app_state;
pub mod archive;
pub mod cache;
pub mod cli;
pub mod columnar;
pub mod dataset;
pub mod error;
pub mod header;
pub mod metadata;
pub mod metrics;
pub mod models;
pub mod object_store;
pub mod orchestrator;
pub mod pipeline;
pub mod regrid;
pub mod resource_manager;
pub mod server;
pub mod status;
pub mod table;
pub mod template;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod validated_json;
