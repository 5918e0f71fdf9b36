//! Weaver conversion service library
//!
//! This library provides the dispatch core of the HTML to PDF/PNG conversion
//! service: a bounded worker pool, cancellable process execution, and
//! pluggable conversion backends with optional artifact storage.
//!
//! ## Module Overview
//!
//! - `config`: environment configuration
//! - `converter`: backend traits and the command-line backend
//! - `error`: typed conversion failures
//! - `executor`: process-group aware command execution
//! - `job`: job models and lifecycle state
//! - `queue`: bounded worker pool with backpressure and deadlines
//! - `server`: axum routes
//! - `source`: conversion request values
//! - `store`: Redis artifact storage
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use weaver::{
//!     converter::CliConverter,
//!     queue::{QueueSettings, WorkQueue},
//!     source::{ConversionSource, Format},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let converter = CliConverter::new("htmlconverter -S -T 120");
//!     let queue = WorkQueue::start(
//!         QueueSettings {
//!             max_workers: 4,
//!             max_queue: 16,
//!             worker_timeout: Duration::from_secs(90),
//!         },
//!         Arc::new(converter),
//!     );
//!
//!     let source = ConversionSource::new("https://example.com", Format::Pdf);
//!     let pdf = queue.submit(source).await.unwrap();
//!     assert!(!pdf.bytes.is_empty());
//!
//!     queue.drain(Duration::from_secs(90)).await;
//! }
//! ```

pub mod config;
pub mod converter;
pub mod error;
pub mod executor;
pub mod job;
pub mod queue;
pub mod server;
pub mod source;
pub mod store;
pub mod telemetry;
