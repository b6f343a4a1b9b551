//! Point batching and InfluxDB line-protocol encoding.
//!
//! Each worker owns a [`Batcher`] holding one [`LineBatch`] per source
//! namespace. A batch carries the sink coordinates of its measurement
//! (database, retention policy, precision) plus the resume bookkeeping the
//! worker needs: the highest operation timestamp and the latest resume token
//! per stream that contributed points. The worker merges that bookkeeping
//! into its committed position only after the batch was written.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Timestamp};

use mongoflux_core::{FieldValue, Measurement, Namespace, Point, ResumeCursor};

/// Points accumulated for one namespace, flushed as one sink write.
#[derive(Debug, Clone)]
pub struct LineBatch {
    pub database: String,
    pub retention: Option<String>,
    pub precision: String,
    points: Vec<Point>,
    max_ts: Option<Timestamp>,
    tokens: HashMap<String, Bson>,
}

impl LineBatch {
    fn new(measurement: &Measurement) -> Self {
        Self {
            database: measurement.database.clone(),
            retention: measurement.retention.clone(),
            precision: measurement.precision.clone(),
            points: Vec::new(),
            max_ts: None,
            tokens: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Highest operation timestamp that entered this batch.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.max_ts
    }

    /// Latest resume token per stream that entered this batch.
    pub fn tokens(&self) -> &HashMap<String, Bson> {
        &self.tokens
    }

    fn push(&mut self, ts: Timestamp, cursor: Option<&ResumeCursor>, point: Point) {
        if self.max_ts.map_or(true, |cur| ts_after(ts, cur)) {
            self.max_ts = Some(ts);
        }
        if let Some(cursor) = cursor {
            self.tokens
                .insert(cursor.stream_id.clone(), cursor.token.clone());
        }
        self.points.push(point);
    }

    /// Encode all points as one newline-separated line-protocol body.
    pub fn encode(&self) -> String {
        let mut body = String::with_capacity(self.points.len().saturating_mul(128));
        for point in &self.points {
            encode_point(point, &self.precision, &mut body);
            body.push('\n');
        }
        body
    }
}

/// Per-worker batch accumulator, one logical batch per source namespace.
#[derive(Debug, Default)]
pub struct Batcher {
    batches: HashMap<Namespace, LineBatch>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point, lazily creating the namespace's batch with the
    /// measurement's sink coordinates. Returns the batch's new size so the
    /// caller can apply the size trigger.
    pub fn add(
        &mut self,
        measurement: &Measurement,
        ts: Timestamp,
        cursor: Option<&ResumeCursor>,
        point: Point,
    ) -> usize {
        let batch = self
            .batches
            .entry(measurement.ns.clone())
            .or_insert_with(|| LineBatch::new(measurement));
        batch.push(ts, cursor, point);
        batch.len()
    }

    /// Remove and return one namespace's batch, if any.
    pub fn take(&mut self, ns: &Namespace) -> Option<LineBatch> {
        self.batches.remove(ns)
    }

    /// Remove and return all batches.
    pub fn drain(&mut self) -> Vec<(Namespace, LineBatch)> {
        self.batches.drain().collect()
    }
}

fn encode_point(point: &Point, precision: &str, out: &mut String) {
    escape_measurement(&point.name, out);
    for (key, value) in &point.tags {
        out.push(',');
        escape_ident(key, out);
        out.push('=');
        escape_ident(value, out);
    }
    out.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if first {
            first = false;
        } else {
            out.push(',');
        }
        escape_ident(key, out);
        out.push('=');
        encode_field_value(value, out);
    }
    out.push(' ');
    out.push_str(&encode_timestamp(point.time, precision).to_string());
}

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

/// Tag keys, tag values, and field keys escape commas, spaces, and equals.
fn escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn encode_field_value(value: &FieldValue, out: &mut String) {
    match value {
        FieldValue::String(s) => {
            out.push('"');
            for ch in s.chars() {
                if ch == '"' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
        FieldValue::Int(i) => {
            out.push_str(&i.to_string());
            out.push('i');
        }
        FieldValue::Float(f) => out.push_str(&f.to_string()),
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    }
}

fn encode_timestamp(time: DateTime<Utc>, precision: &str) -> i64 {
    match precision {
        "n" | "ns" => time.timestamp_nanos_opt().unwrap_or(i64::MAX),
        "u" | "us" => time.timestamp_micros(),
        "ms" => time.timestamp_millis(),
        _ => time.timestamp(),
    }
}

fn ts_after(a: Timestamp, b: Timestamp) -> bool {
    (a.time, a.increment) > (b.time, b.increment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoflux_core::{MeasurementSpec, TransformRegistry};
    use std::collections::BTreeMap;

    fn measurement(precision: Option<&str>) -> Measurement {
        let spec = MeasurementSpec {
            namespace: "db.c".to_string(),
            fields: vec!["v".to_string()],
            retention: Some("autogen".to_string()),
            precision: precision.map(String::from),
            ..MeasurementSpec::default()
        };
        mongoflux_core::Measurement::compile(&spec, &TransformRegistry::new()).unwrap()
    }

    fn point(name: &str, tags: &[(&str, &str)], fields: Vec<(&str, FieldValue)>, secs: i64) -> Point {
        Point {
            name: name.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
            time: DateTime::from_timestamp(secs, 0).unwrap(),
        }
    }

    fn ts(secs: u32, ord: u32) -> Timestamp {
        Timestamp {
            time: secs,
            increment: ord,
        }
    }

    #[test]
    fn encodes_tags_fields_and_seconds_timestamp() {
        let m = measurement(None);
        let mut batcher = Batcher::new();
        batcher.add(
            &m,
            ts(1, 0),
            None,
            point(
                "cpu",
                &[("host", "a1"), ("region", "eu")],
                vec![
                    ("usage", FieldValue::Float(0.5)),
                    ("cores", FieldValue::Int(8)),
                    ("up", FieldValue::Bool(true)),
                    ("note", FieldValue::String("ok".to_string())),
                ],
                1_700_000_000,
            ),
        );
        let batch = batcher.take(&m.ns).unwrap();
        assert_eq!(
            batch.encode(),
            "cpu,host=a1,region=eu cores=8i,note=\"ok\",up=true,usage=0.5 1700000000\n"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let m = measurement(None);
        let mut batcher = Batcher::new();
        batcher.add(
            &m,
            ts(1, 0),
            None,
            point(
                "a b,c",
                &[("t k", "v=x")],
                vec![("f,1", FieldValue::String("say \"hi\"".to_string()))],
                0,
            ),
        );
        let batch = batcher.take(&m.ns).unwrap();
        assert_eq!(
            batch.encode(),
            "a\\ b\\,c,t\\ k=v\\=x f\\,1=\"say \\\"hi\\\"\" 0\n"
        );
    }

    #[test]
    fn precision_scales_the_timestamp() {
        let m = measurement(Some("ms"));
        let mut batcher = Batcher::new();
        batcher.add(
            &m,
            ts(1, 0),
            None,
            point("c", &[], vec![("v", FieldValue::Int(1))], 2),
        );
        let batch = batcher.take(&m.ns).unwrap();
        assert!(batch.encode().ends_with(" 2000\n"));
    }

    #[test]
    fn two_adds_make_one_two_line_batch() {
        let m = measurement(None);
        let mut batcher = Batcher::new();
        let size = batcher.add(
            &m,
            ts(1, 0),
            None,
            point("c", &[], vec![("v", FieldValue::Int(1))], 1),
        );
        assert_eq!(size, 1);
        let size = batcher.add(
            &m,
            ts(2, 0),
            None,
            point("c", &[], vec![("v", FieldValue::Int(2))], 2),
        );
        assert_eq!(size, 2);

        let batch = batcher.take(&m.ns).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.encode().lines().count(), 2);
        assert_eq!(batch.database, "db");
        assert_eq!(batch.retention.as_deref(), Some("autogen"));
        assert!(batcher.take(&m.ns).is_none());
    }

    #[test]
    fn batch_tracks_resume_bookkeeping() {
        let m = measurement(None);
        let mut batcher = Batcher::new();
        let cursor_a = ResumeCursor {
            stream_id: "db.c".to_string(),
            token: Bson::String("t1".to_string()),
        };
        let cursor_b = ResumeCursor {
            stream_id: "db.c".to_string(),
            token: Bson::String("t2".to_string()),
        };
        batcher.add(
            &m,
            ts(5, 2),
            Some(&cursor_a),
            point("c", &[], vec![("v", FieldValue::Int(1))], 5),
        );
        batcher.add(
            &m,
            ts(5, 9),
            Some(&cursor_b),
            point("c", &[], vec![("v", FieldValue::Int(2))], 5),
        );
        batcher.add(
            &m,
            ts(4, 0),
            None,
            point("c", &[], vec![("v", FieldValue::Int(3))], 4),
        );

        let batch = batcher.take(&m.ns).unwrap();
        assert_eq!(batch.max_timestamp(), Some(ts(5, 9)));
        assert_eq!(
            batch.tokens().get("db.c"),
            Some(&Bson::String("t2".to_string()))
        );
    }

    #[test]
    fn drain_empties_the_batcher() {
        let m = measurement(None);
        let mut batcher = Batcher::new();
        batcher.add(
            &m,
            ts(1, 0),
            None,
            point("c", &[], vec![("v", FieldValue::Int(1))], 1),
        );
        let drained = batcher.drain();
        assert_eq!(drained.len(), 1);
        assert!(batcher.drain().is_empty());
    }
}
