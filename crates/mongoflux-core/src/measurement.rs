//! Measurement rules: the static binding between one source namespace and
//! one sink point schema. Specs are deserialized from `[[measurement]]`
//! tables in the config file and compiled once at startup; compiled
//! measurements are immutable for the life of the run.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::{DocTransform, OpFilter, TransformRegistry};
use crate::Namespace;

/// Default sink timestamp precision.
pub const DEFAULT_PRECISION: &str = "s";

/// One `[[measurement]]` table as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSpec {
    /// Source namespace, `database.collection`.
    pub namespace: String,
    /// Alternate namespace re-read by identity when change-tail events
    /// arrive; used for views and materialized projections.
    pub view: Option<String>,
    /// Document field holding the point time. Empty or absent means the
    /// operation timestamp is used.
    pub timefield: Option<String>,
    /// Sink retention policy name, passed through verbatim.
    pub retention: Option<String>,
    /// Sink timestamp precision; defaults to seconds.
    pub precision: Option<String>,
    /// Point name, literal or a `{{...}}` template over tags, fields, and
    /// the document. Defaults to the namespace's collection part.
    pub measure: Option<String>,
    /// Sink database. Defaults to the namespace's database part.
    pub database: Option<String>,
    /// Tag mappings, each `"path"` or `"path:rename"`.
    pub tags: Vec<String>,
    /// Field mappings, each `"path"` or `"path:rename"`.
    pub fields: Vec<String>,
    /// Name of a registered transform that replaces declarative projection.
    pub transform: Option<String>,
    /// Name of a registered operation-level predicate applied before
    /// projection.
    pub filter: Option<String>,
    /// Field coercions applied after projection, each `"name:int"` or
    /// `"name:float"` with `name` the projected field name.
    pub coerce: Vec<String>,
}

/// Numeric coercion applied to a projected field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Int,
    Float,
}

/// A compiled measurement.
#[derive(Clone)]
pub struct Measurement {
    pub ns: Namespace,
    pub view: Option<Namespace>,
    /// `None` means the point time is the operation timestamp.
    pub timefield: Option<String>,
    pub retention: Option<String>,
    pub precision: String,
    /// Literal name or template source; the projection engine compiles
    /// templates once per run.
    pub measure: String,
    pub database: String,
    /// Source field path to sink tag name.
    pub tags: BTreeMap<String, String>,
    /// Source field path to sink field name.
    pub fields: BTreeMap<String, String>,
    /// Projected field name to coercion.
    pub coerce: BTreeMap<String, Coercion>,
    pub transform: Option<Arc<dyn DocTransform>>,
    pub filter: Option<Arc<dyn OpFilter>>,
}

impl std::fmt::Debug for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Measurement")
            .field("ns", &self.ns)
            .field("view", &self.view)
            .field("timefield", &self.timefield)
            .field("retention", &self.retention)
            .field("precision", &self.precision)
            .field("measure", &self.measure)
            .field("database", &self.database)
            .field("tags", &self.tags)
            .field("fields", &self.fields)
            .field("coerce", &self.coerce)
            .field("transform", &self.transform.as_ref().map(|_| "<transform>"))
            .field("filter", &self.filter.as_ref().map(|_| "<filter>"))
            .finish()
    }
}

impl Measurement {
    /// Compile a spec, resolving registry names. Fails on an unparseable
    /// namespace, a measurement with neither fields nor transform, or an
    /// unknown transform/filter/coercion entry.
    pub fn compile(spec: &MeasurementSpec, registry: &TransformRegistry) -> Result<Self> {
        let ns = Namespace::parse(&spec.namespace)
            .with_context(|| format!("measurement namespace {:?}", spec.namespace))?;
        let view = spec
            .view
            .as_deref()
            .map(Namespace::parse)
            .transpose()
            .with_context(|| format!("measurement {} view", ns))?;

        if spec.fields.is_empty() && spec.transform.is_none() {
            bail!("measurement {ns} has neither fields nor a transform");
        }

        let transform = spec
            .transform
            .as_deref()
            .map(|name| {
                registry
                    .transform(name)
                    .with_context(|| format!("measurement {ns}: transform {name:?} is not registered"))
            })
            .transpose()?;
        let filter = spec
            .filter
            .as_deref()
            .map(|name| {
                registry
                    .filter(name)
                    .with_context(|| format!("measurement {ns}: filter {name:?} is not registered"))
            })
            .transpose()?;

        let mut coerce = BTreeMap::new();
        for entry in &spec.coerce {
            let (field, kind) = entry
                .split_once(':')
                .with_context(|| format!("measurement {ns}: coerce entry {entry:?}"))?;
            let kind = match kind {
                "int" => Coercion::Int,
                "float" => Coercion::Float,
                other => bail!("measurement {ns}: unknown coercion {other:?} in {entry:?}"),
            };
            coerce.insert(field.to_string(), kind);
        }

        // An empty timefield string means "use the operation time", same as
        // leaving it out.
        let timefield = spec.timefield.clone().filter(|f| !f.is_empty());

        Ok(Self {
            measure: spec
                .measure
                .clone()
                .unwrap_or_else(|| ns.coll.clone()),
            database: spec.database.clone().unwrap_or_else(|| ns.db.clone()),
            precision: spec
                .precision
                .clone()
                .unwrap_or_else(|| DEFAULT_PRECISION.to_string()),
            retention: spec.retention.clone(),
            tags: parse_mappings(&spec.tags),
            fields: parse_mappings(&spec.fields),
            timefield,
            coerce,
            transform,
            filter,
            ns,
            view,
        })
    }
}

/// Parse `"path"` / `"path:rename"` mapping entries. Without a rename the
/// sink name is the source path itself.
fn parse_mappings(entries: &[String]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((path, rename)) => (path.to_string(), rename.to_string()),
            None => (entry.clone(), entry.clone()),
        })
        .collect()
}

/// All compiled measurements, indexed by source namespace.
#[derive(Clone, Default)]
pub struct MeasurementSet {
    by_ns: HashMap<Namespace, Measurement>,
}

impl MeasurementSet {
    pub fn compile(specs: &[MeasurementSpec], registry: &TransformRegistry) -> Result<Self> {
        let mut by_ns = HashMap::with_capacity(specs.len());
        for spec in specs {
            let m = Measurement::compile(spec, registry)?;
            if by_ns.insert(m.ns.clone(), m).is_some() {
                bail!("duplicate measurement for namespace {}", spec.namespace);
            }
        }
        Ok(Self { by_ns })
    }

    pub fn get(&self, ns: &Namespace) -> Option<&Measurement> {
        self.by_ns.get(ns)
    }

    pub fn contains(&self, ns: &Namespace) -> bool {
        self.by_ns.contains_key(ns)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.by_ns.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.by_ns.values()
    }

    pub fn len(&self) -> usize {
        self.by_ns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ns.is_empty()
    }
}
