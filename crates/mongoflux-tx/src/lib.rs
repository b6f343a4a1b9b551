//! # Mongoflux Projection Engine
//!
//! Converts one ingested operation into zero or more InfluxDB points,
//! following the operation's measurement rule. Two modes:
//!
//! - **Declarative**: the measurement's tag/field mappings are applied to
//!   the document, nested maps are flattened one level deep into dotted
//!   paths, and the point time comes from the operation or from a configured
//!   time field.
//! - **Transform**: a registered transform produces the points, and only the
//!   point name resolution is shared with declarative mode.
//!
//! Type mismatches on mapped paths drop the value, not the operation; an
//! unresolvable time field drops the operation.

pub mod template;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use tracing::{debug, warn};

use mongoflux_core::{
    Coercion, FieldValue, Measurement, MeasurementSet, Namespace, Operation, PipelineError, Point,
    TransformInput,
};

use crate::template::Template;

/// Name of the identity field skipped during flattening.
const ID_FIELD: &str = "_id";

/// The projection engine. Owns the point-name templates, compiled once from
/// the measurement set; everything else is stateless.
pub struct Projector {
    templates: HashMap<Namespace, Template>,
}

impl Projector {
    /// Compile all templated measure names. A malformed template is a
    /// startup error.
    pub fn new(measurements: &MeasurementSet) -> Result<Self> {
        let mut templates = HashMap::new();
        for m in measurements.iter() {
            if Template::is_template(&m.measure) {
                templates.insert(m.ns.clone(), Template::parse(&m.measure)?);
            }
        }
        Ok(Self { templates })
    }

    /// Project one operation through its measurement.
    pub fn project(
        &self,
        op: &Operation,
        measurement: &Measurement,
    ) -> Result<Vec<Point>, PipelineError> {
        match &measurement.transform {
            Some(transform) => {
                let input = TransformInput {
                    data: &op.doc,
                    ns: &op.ns,
                    operation: op.kind,
                };
                let produced = transform.apply(&input).map_err(|e| {
                    PipelineError::InvalidDocument(format!("transform failed: {e:#}"))
                })?;
                Ok(produced
                    .into_iter()
                    .map(|p| Point {
                        name: self.point_name(measurement, &p.tags, &p.fields, &op.doc),
                        tags: p.tags,
                        fields: p.fields,
                        time: p.timestamp,
                    })
                    .collect())
            }
            None => self.project_declarative(op, measurement),
        }
    }

    fn project_declarative(
        &self,
        op: &Operation,
        m: &Measurement,
    ) -> Result<Vec<Point>, PipelineError> {
        let mut tags = BTreeMap::new();
        let mut fields = BTreeMap::new();
        let mut time = match m.timefield {
            None => Some(op.time()),
            Some(_) => None,
        };

        for (path, value) in flatten(&op.doc) {
            if let Some(tag_name) = m.tags.get(&path) {
                match &value {
                    Bson::String(s) => {
                        tags.insert(tag_name.clone(), s.clone());
                    }
                    other => {
                        warn!(ns = %op.ns, path, value = ?other, "tag value is not a string, dropping");
                    }
                }
            }
            if let Some(field_name) = m.fields.get(&path) {
                match FieldValue::from_bson(&value) {
                    Some(v) => {
                        fields.insert(field_name.clone(), v);
                    }
                    None => {
                        warn!(ns = %op.ns, path, value = ?value, "field value is not a primitive, dropping");
                    }
                }
            }
            if let Some(timefield) = &m.timefield {
                if path == *timefield {
                    if let Some(t) = time_from_bson(&value) {
                        time = Some(t);
                    }
                }
            }
        }

        let time = time.ok_or_else(|| {
            PipelineError::InvalidDocument(format!(
                "time field {} not found or wrong type",
                m.timefield.as_deref().unwrap_or_default()
            ))
        })?;

        if fields.is_empty() {
            debug!(ns = %op.ns, "no fields mapped, skipping operation");
            return Ok(Vec::new());
        }

        for (name, how) in &m.coerce {
            if let Some(value) = fields.get_mut(name) {
                coerce(value, *how);
            }
        }

        Ok(vec![Point {
            name: self.point_name(m, &tags, &fields, &op.doc),
            tags,
            fields,
            time,
        }])
    }

    fn point_name(
        &self,
        m: &Measurement,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        doc: &Document,
    ) -> String {
        match self.templates.get(&m.ns) {
            Some(template) => template.render(tags, fields, doc),
            None => m.measure.clone(),
        }
    }
}

/// Flatten the top level of a document. Nested maps contribute their
/// non-map children under dotted paths; deeper nesting is dropped. Arrays
/// and other non-primitive leaves are kept so that mapped paths can report
/// the type mismatch. The identity field is skipped.
fn flatten(doc: &Document) -> Vec<(String, Bson)> {
    let mut leaves = Vec::new();
    for (key, value) in doc {
        if key == ID_FIELD {
            continue;
        }
        match value {
            Bson::Document(child) => {
                for (child_key, child_value) in child {
                    if !matches!(child_value, Bson::Document(_)) {
                        leaves.push((format!("{key}.{child_key}"), child_value.clone()));
                    }
                }
            }
            other => leaves.push((key.clone(), other.clone())),
        }
    }
    leaves
}

/// Interpret a document value as a point time: either a BSON date-time or a
/// source timestamp.
fn time_from_bson(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Some(dt.to_chrono()),
        Bson::Timestamp(ts) => DateTime::from_timestamp(i64::from(ts.time), 0),
        _ => None,
    }
}

fn coerce(value: &mut FieldValue, how: Coercion) {
    match (how, &*value) {
        (Coercion::Float, FieldValue::Int(i)) => *value = FieldValue::Float(*i as f64),
        (Coercion::Int, FieldValue::Float(f)) => *value = FieldValue::Int(*f as i64),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mongodb::bson::{doc, Timestamp};
    use mongoflux_core::{MeasurementSpec, OpKind, OpOrigin, TransformRegistry, TransformedPoint};

    fn operation(doc: Document, secs: u32) -> Operation {
        Operation {
            id: Bson::Int32(1),
            ns: Namespace::parse("db.c").unwrap(),
            kind: OpKind::Insert,
            ts: Timestamp {
                time: secs,
                increment: 0,
            },
            doc,
            origin: OpOrigin::ChangeTail,
            cursor: None,
        }
    }

    fn compile(spec: MeasurementSpec, registry: &TransformRegistry) -> (Projector, Measurement) {
        let set = MeasurementSet::compile(&[spec], registry).unwrap();
        let m = set.get(&Namespace::parse("db.c").unwrap()).unwrap().clone();
        (Projector::new(&set).unwrap(), m)
    }

    fn fields_spec(fields: &[&str]) -> MeasurementSpec {
        MeasurementSpec {
            namespace: "db.c".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            ..MeasurementSpec::default()
        }
    }

    #[test]
    fn minimum_viable_point_uses_operation_time() {
        let (projector, m) = compile(fields_spec(&["temp"]), &TransformRegistry::new());
        let op = operation(doc! {"_id": 1, "temp": 21.5}, 1_700_000_000);

        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.name, "c");
        assert!(p.tags.is_empty());
        assert_eq!(p.fields.get("temp"), Some(&FieldValue::Float(21.5)));
        assert_eq!(p.time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn renames_and_timefield_resolve() {
        let mut spec = fields_spec(&["v:value"]);
        spec.tags = vec!["region:r".to_string()];
        spec.timefield = Some("at".to_string());
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let at = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let op = operation(
            doc! {
                "_id": 2,
                "at": mongodb::bson::DateTime::from_chrono(at),
                "region": "eu",
                "value is ignored": 0,
                "region_unmapped": "x",
                "v": 7,
            },
            1_700_000_000,
        );

        let points = projector.project(&op, &m).unwrap();
        let p = &points[0];
        assert_eq!(p.name, "c");
        assert_eq!(p.tags.get("r").map(String::as_str), Some("eu"));
        assert_eq!(p.fields.get("value"), Some(&FieldValue::Int(7)));
        assert_eq!(p.fields.len(), 1);
        assert_eq!(p.time, at);
    }

    #[test]
    fn flattening_is_one_level_and_rejects_non_primitives() {
        let (projector, m) = compile(fields_spec(&["m.x", "m.y"]), &TransformRegistry::new());
        let op = operation(
            doc! {"_id": 3, "m": {"x": 1, "y": [1, 2], "z": {"q": 1}}},
            1_700_000_000,
        );

        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points.len(), 1);
        let p = &points[0];
        assert_eq!(p.fields.get("m.x"), Some(&FieldValue::Int(1)));
        assert!(p.fields.get("m.y").is_none());
        assert!(p.fields.get("m.z.q").is_none());
        assert_eq!(p.fields.len(), 1);
    }

    #[test]
    fn unmapped_fields_do_not_leak() {
        let (projector, m) = compile(fields_spec(&["a", "b:B"]), &TransformRegistry::new());
        let op = operation(doc! {"_id": 4, "a": 1, "b": "x", "c": 7}, 1_700_000_000);

        let p = &projector.project(&op, &m).unwrap()[0];
        assert_eq!(p.fields.get("a"), Some(&FieldValue::Int(1)));
        assert_eq!(
            p.fields.get("B"),
            Some(&FieldValue::String("x".to_string()))
        );
        assert!(p.fields.get("c").is_none());
        assert!(p.fields.get("b").is_none());
    }

    #[test]
    fn templated_name_renders_from_tags() {
        let mut spec = fields_spec(&["v"]);
        spec.tags = vec!["region:r".to_string()];
        spec.measure = Some("{{index .Tags \"r\"}}_metric".to_string());
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let op = operation(doc! {"_id": 4, "region": "us", "v": 3}, 1_700_000_000);
        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points[0].name, "us_metric");
    }

    #[test]
    fn missing_timefield_fails_the_operation() {
        let mut spec = fields_spec(&["v"]);
        spec.timefield = Some("at".to_string());
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let op = operation(doc! {"_id": 5, "v": 1}, 1_700_000_000);
        let err = projector.project(&op, &m).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDocument(_)));

        // Wrong type is the same failure.
        let op = operation(doc! {"_id": 5, "at": "yesterday", "v": 1}, 1_700_000_000);
        assert!(projector.project(&op, &m).is_err());
    }

    #[test]
    fn timefield_accepts_source_timestamps() {
        let mut spec = fields_spec(&["v"]);
        spec.timefield = Some("at".to_string());
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let op = operation(
            doc! {"_id": 6, "at": Bson::Timestamp(Timestamp { time: 1_600_000_000, increment: 3 }), "v": 1},
            1_700_000_000,
        );
        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points[0].time.timestamp(), 1_600_000_000);
    }

    #[test]
    fn non_string_tag_is_dropped_but_point_survives() {
        let mut spec = fields_spec(&["v"]);
        spec.tags = vec!["region:r".to_string()];
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let op = operation(doc! {"_id": 7, "region": 9, "v": 1}, 1_700_000_000);
        let points = projector.project(&op, &m).unwrap();
        assert!(points[0].tags.is_empty());
        assert_eq!(points[0].fields.len(), 1);
    }

    #[test]
    fn no_remaining_fields_emits_no_point() {
        let (projector, m) = compile(fields_spec(&["v"]), &TransformRegistry::new());
        let op = operation(doc! {"_id": 8, "v": [1, 2, 3]}, 1_700_000_000);
        assert!(projector.project(&op, &m).unwrap().is_empty());
    }

    #[test]
    fn coercion_widens_projected_fields() {
        let mut spec = fields_spec(&["finality"]);
        spec.coerce = vec!["finality:float".to_string()];
        let (projector, m) = compile(spec, &TransformRegistry::new());

        let op = operation(doc! {"_id": 9, "finality": 12}, 1_700_000_000);
        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points[0].fields.get("finality"), Some(&FieldValue::Float(12.0)));
    }

    fn split(input: &TransformInput<'_>) -> anyhow::Result<Vec<TransformedPoint>> {
        let base = input.data.get_i64("v").unwrap_or_default();
        Ok((0..2)
            .map(|i| TransformedPoint {
                tags: BTreeMap::new(),
                fields: [(format!("v{i}"), FieldValue::Int(base + i))]
                    .into_iter()
                    .collect(),
                timestamp: Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
            })
            .collect())
    }

    #[test]
    fn transform_mode_emits_returned_points() {
        let mut registry = TransformRegistry::new();
        registry.register_transform("split", split);
        let mut spec = fields_spec(&[]);
        spec.transform = Some("split".to_string());
        let (projector, m) = compile(spec, &registry);

        let op = operation(doc! {"_id": 10, "v": 5_i64}, 1_700_000_000);
        let points = projector.project(&op, &m).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, "c");
        assert_eq!(points[0].fields.get("v0"), Some(&FieldValue::Int(5)));
        assert_eq!(points[1].fields.get("v1"), Some(&FieldValue::Int(6)));
    }

    fn boom(_: &TransformInput<'_>) -> anyhow::Result<Vec<TransformedPoint>> {
        anyhow::bail!("bad shape")
    }

    #[test]
    fn transform_errors_fail_the_operation_only() {
        let mut registry = TransformRegistry::new();
        registry.register_transform("boom", boom);
        let mut spec = fields_spec(&[]);
        spec.transform = Some("boom".to_string());
        let (projector, m) = compile(spec, &registry);

        let op = operation(doc! {"_id": 11}, 1_700_000_000);
        assert!(matches!(
            projector.project(&op, &m),
            Err(PipelineError::InvalidDocument(_))
        ));
    }
}
