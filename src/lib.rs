//! # Silt
//!
//! A write-optimized ingest and buffering engine for a high-dimensional
//! vector database: absorbs bursts of tens of thousands of writes per second
//! while staying queryable (read-your-writes) and crash-consistent.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼
//! WAL (epoch issuance, durability)
//!     │
//!     ▼
//! BEpsilonTree (routing, cascade, flush selection)
//!     ├── MessageBuffer (sharded queues, dedup, backpressure)
//!     └── LatestByIdMap (authoritative location per identity)
//!     │
//!     ▼
//! SegmentEncoder (external; durable segment files)
//!     │
//!     ▼
//! Manifest (generation-numbered commit point)
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use silt::{Config, Engine};
//! use silt::segment::mock::{MockEncoderConfig, MockSegmentEncoder};
//!
//! let encoder = Arc::new(MockSegmentEncoder::new("data/segments", MockEncoderConfig::fast())?);
//! let engine = Engine::open(Config::from_env()?, "data", encoder).await?;
//! engine.upsert(entry).await?;
//! let candidates = engine.scan("tenant", "namespace", &[], 10_000);
//! ```

pub mod betree;
pub mod buffer;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod hash;
pub mod latest;
pub mod manifest;
pub mod segment;
pub mod types;
pub mod wal;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, SiltError};
pub use types::{
    Epoch, HashRange, Message, OpKind, QueryFilter, SegmentDescriptor, SegmentRow, TagId,
    Timestamp, VectorEntry, VectorId, VectorLocation,
};
