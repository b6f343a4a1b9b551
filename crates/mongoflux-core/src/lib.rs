//! # Mongoflux Core
//!
//! Foundational types for the mongoflux replication pipeline: the operation
//! and point data model, the measurement rules that bind a MongoDB namespace
//! to an InfluxDB point schema, configuration loading and flag/file merging,
//! and the registry of compiled-in transforms and operation filters.
//!
//! ## Key Components
//!
//! - **Operation model**: change events ingested from MongoDB, tagged with
//!   their origin (backfill scan or change tail) and resume cursor
//! - **Point model**: the time-series datum written to InfluxDB
//! - **Measurements**: immutable per-namespace projection rules compiled once
//!   at startup
//! - **Registry**: named transform/filter implementations referenced from
//!   configuration
//! - **Run status**: the process-wide sticky exit status shared by workers

pub mod config;
pub mod measurement;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document, Timestamp};

pub use config::{FileConfig, GtmSettings, InfluxSettings, Overrides, ResumeStrategy, Settings};
pub use measurement::{Coercion, Measurement, MeasurementSet, MeasurementSpec};
pub use registry::{DocTransform, OpFilter, TransformInput, TransformRegistry, TransformedPoint};

/// Name of the pipeline's internal database on the source server. Operations
/// touching it are never replicated; resume state lives in it.
pub const INTERNAL_DB: &str = "mongofluxd";

/// Collection holding timestamp resume documents, one per resume name.
pub const RESUME_COLLECTION: &str = "resume";

/// Collection holding change-stream resume tokens, one per (resume name, stream).
pub const TOKEN_COLLECTION: &str = "tokens";

/// Sender half of the shared operation channel between the ingestion source
/// and the worker pool. Multi-consumer: every worker holds a clone of the
/// receiver and whichever is free takes the next operation.
pub type OpTx = async_channel::Sender<Operation>;

/// Receiver half of the shared operation channel.
pub type OpRx = async_channel::Receiver<Operation>;

/// Sender half of the ingestion error channel.
pub type ErrTx = async_channel::Sender<anyhow::Error>;

/// Receiver half of the ingestion error channel.
pub type ErrRx = async_channel::Receiver<anyhow::Error>;

/// Error types for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The document cannot be projected into a point, e.g. the configured
    /// time field is absent or has an unusable type.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A channel between pipeline stages closed unexpectedly.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A two-part MongoDB namespace, `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    /// Parse a `"database.collection"` string. The collection part may itself
    /// contain dots; the split happens at the first one.
    pub fn parse(s: &str) -> Result<Self, PipelineError> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(PipelineError::InvalidDocument(format!(
                "namespace {s:?} is not of the form database.collection"
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Kind of source change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
            OpKind::Other => "other",
        }
    }
}

/// Where an operation entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOrigin {
    /// Produced by the initial full scan of a namespace.
    Backfill,
    /// Produced by the oplog tail or a change stream.
    ChangeTail,
}

/// Resume cursor carried by change-tail operations: the stream it came from
/// plus the opaque token that restarts the stream just past this event.
#[derive(Debug, Clone)]
pub struct ResumeCursor {
    pub stream_id: String,
    pub token: Bson,
}

/// A single ingested change event.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Source document identity (`_id`), opaque to the pipeline.
    pub id: Bson,
    pub ns: Namespace,
    pub kind: OpKind,
    /// Source-database timestamp: seconds plus ordinal within the second.
    pub ts: Timestamp,
    pub doc: Document,
    pub origin: OpOrigin,
    /// Present only on change-tail operations.
    pub cursor: Option<ResumeCursor>,
}

impl Operation {
    /// The operation timestamp as wall-clock time, used as the point time
    /// when a measurement has no `timefield`.
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.ts.time), 0).unwrap_or_default()
    }
}

/// An InfluxDB field value. BSON `Int32` widens to `Int`, `Double` maps to
/// `Float`; everything else is not a field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    /// Convert an acceptable BSON primitive, or `None` for any other type.
    pub fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::String(s) => Some(FieldValue::String(s.clone())),
            Bson::Int32(i) => Some(FieldValue::Int(i64::from(*i))),
            Bson::Int64(i) => Some(FieldValue::Int(*i)),
            Bson::Double(f) => Some(FieldValue::Float(*f)),
            Bson::Boolean(b) => Some(FieldValue::Bool(*b)),
            _ => None,
        }
    }

    /// Plain-text rendering, used when a field value appears in a templated
    /// point name.
    pub fn render(&self) -> String {
        match self {
            FieldValue::String(s) => s.clone(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        }
    }
}

/// One time-series datum headed for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: DateTime<Utc>,
}

/// Process-wide sticky run status. Recoverable errors anywhere in the
/// pipeline flip it; the process exits 1 if it was ever flipped.
#[derive(Debug, Default)]
pub struct RunStatus {
    failed: AtomicBool,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.is_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_parse_splits_at_first_dot() {
        let ns = Namespace::parse("db.system.profile").unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "system.profile");
        assert_eq!(ns.to_string(), "db.system.profile");
    }

    #[test]
    fn namespace_parse_rejects_missing_parts() {
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
    }

    #[test]
    fn field_value_accepts_primitives_only() {
        assert_eq!(
            FieldValue::from_bson(&Bson::Int32(7)),
            Some(FieldValue::Int(7))
        );
        assert_eq!(
            FieldValue::from_bson(&Bson::Double(1.5)),
            Some(FieldValue::Float(1.5))
        );
        assert_eq!(
            FieldValue::from_bson(&Bson::Boolean(true)),
            Some(FieldValue::Bool(true))
        );
        assert!(FieldValue::from_bson(&Bson::Array(vec![Bson::Int32(1)])).is_none());
        assert!(FieldValue::from_bson(&Bson::Null).is_none());
    }

    #[test]
    fn run_status_is_sticky() {
        let status = RunStatus::new();
        assert_eq!(status.exit_code(), 0);
        status.set_failed();
        status.set_failed();
        assert!(status.is_failed());
        assert_eq!(status.exit_code(), 1);
    }
}
