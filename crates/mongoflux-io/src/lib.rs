//! # Mongoflux I/O
//!
//! Concrete endpoints of the replication pipeline: the MongoDB ingestion
//! source (backfill scans fused with the change tail), the InfluxDB sink
//! writer with per-namespace batching, and the resume store that persists
//! restart positions in the pipeline's internal database.

/// Per-namespace point batches and line-protocol encoding
pub mod batch;

/// Resume position persistence and startup resolution
pub mod resume;

/// InfluxDB HTTP sink writer
pub mod sink_influx;

/// MongoDB backfill + change-tail source
pub mod source_mongo;

pub use batch::{Batcher, LineBatch};
pub use resume::{next_after, resolve_resume_point, ResumePoint, ResumeStore};
pub use sink_influx::InfluxWriter;
pub use source_mongo::{MongoSource, SourceChannels, SourceSettings};
