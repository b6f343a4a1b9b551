//! Named transform and filter implementations.
//!
//! A measurement may reference a transform (turning one document into any
//! number of points) or an operation filter (a predicate that drops
//! operations before projection). Implementations are compiled into the
//! binary and registered by name; configuration references the name. An
//! unknown name fails measurement compilation at startup.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mongodb::bson::Document;

use crate::{FieldValue, Namespace, OpKind};

/// The document handed to a transform or filter, with the context of the
/// operation it came from.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    pub data: &'a Document,
    pub ns: &'a Namespace,
    pub operation: OpKind,
}

impl TransformInput<'_> {
    pub fn database(&self) -> &str {
        &self.ns.db
    }

    pub fn collection(&self) -> &str {
        &self.ns.coll
    }
}

/// One point produced by a transform. The point name is resolved afterwards
/// from the measurement's `measure` setting.
#[derive(Debug, Clone)]
pub struct TransformedPoint {
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

/// A user-supplied projection: one source document in, zero or more points
/// out. Errors drop the operation but never the pipeline.
pub trait DocTransform: Send + Sync {
    fn apply(&self, input: &TransformInput<'_>) -> anyhow::Result<Vec<TransformedPoint>>;
}

impl<F> DocTransform for F
where
    F: Fn(&TransformInput<'_>) -> anyhow::Result<Vec<TransformedPoint>> + Send + Sync,
{
    fn apply(&self, input: &TransformInput<'_>) -> anyhow::Result<Vec<TransformedPoint>> {
        self(input)
    }
}

/// An operation-level predicate. Operations it rejects are dropped before
/// projection, silently.
pub trait OpFilter: Send + Sync {
    fn accept(&self, input: &TransformInput<'_>) -> bool;
}

impl<F> OpFilter for F
where
    F: Fn(&TransformInput<'_>) -> bool + Send + Sync,
{
    fn accept(&self, input: &TransformInput<'_>) -> bool {
        self(input)
    }
}

/// Registry of compiled-in transforms and filters, keyed by the names used in
/// measurement configuration.
#[derive(Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn DocTransform>>,
    filters: HashMap<String, Arc<dyn OpFilter>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transform<T>(&mut self, name: impl Into<String>, transform: T)
    where
        T: DocTransform + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: OpFilter + 'static,
    {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub fn transform(&self, name: &str) -> Option<Arc<dyn DocTransform>> {
        self.transforms.get(name).cloned()
    }

    pub fn filter(&self, name: &str) -> Option<Arc<dyn OpFilter>> {
        self.filters.get(name).cloned()
    }
}
