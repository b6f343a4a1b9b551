//! Point-name templates.
//!
//! A measurement's `measure` setting may interpolate projected tags and
//! fields or raw document values into the point name, e.g.
//! `{{index .Tags "region"}}_metric`. This is a fixed-form interpreter over
//! the three scopes, not a general template engine: an expression is either
//! `index .Scope "key"` or a dotted `.Scope.key`, with `Scope` one of
//! `Tags`, `Fields`, `Doc`. Missing keys render as the empty string.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use mongodb::bson::{Bson, Document};

use mongoflux_core::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Tags,
    Fields,
    Doc,
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Lookup(Scope, String),
}

/// A compiled point-name template.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Whether a measure string needs template compilation at all.
    pub fn is_template(source: &str) -> bool {
        source.contains("{{")
    }

    pub fn parse(source: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = source;
        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .with_context(|| format!("unterminated {{{{ in template {source:?}"))?;
            parts.push(parse_expr(after[..end].trim())
                .with_context(|| format!("in template {source:?}"))?);
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(
        &self,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, FieldValue>,
        doc: &Document,
    ) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Lookup(Scope::Tags, key) => {
                    if let Some(v) = tags.get(key) {
                        out.push_str(v);
                    }
                }
                Part::Lookup(Scope::Fields, key) => {
                    if let Some(v) = fields.get(key) {
                        out.push_str(&v.render());
                    }
                }
                Part::Lookup(Scope::Doc, key) => {
                    if let Some(v) = doc.get(key) {
                        out.push_str(&bson_text(v));
                    }
                }
            }
        }
        out
    }
}

fn parse_expr(expr: &str) -> Result<Part> {
    if let Some(rest) = expr.strip_prefix("index ") {
        let rest = rest.trim();
        let (scope, key) = rest
            .split_once(char::is_whitespace)
            .with_context(|| format!("expected `index .Scope \"key\"`, got {expr:?}"))?;
        let key = key.trim();
        let key = key
            .strip_prefix('"')
            .and_then(|k| k.strip_suffix('"'))
            .with_context(|| format!("index key must be quoted in {expr:?}"))?;
        Ok(Part::Lookup(parse_scope(scope)?, key.to_string()))
    } else if let Some(path) = expr.strip_prefix('.') {
        let (scope, key) = path
            .split_once('.')
            .with_context(|| format!("expected `.Scope.key`, got {expr:?}"))?;
        Ok(Part::Lookup(parse_scope_name(scope)?, key.to_string()))
    } else {
        bail!("unsupported template expression {expr:?}");
    }
}

fn parse_scope(dotted: &str) -> Result<Scope> {
    let name = dotted
        .strip_prefix('.')
        .with_context(|| format!("expected .Tags/.Fields/.Doc, got {dotted:?}"))?;
    parse_scope_name(name)
}

fn parse_scope_name(name: &str) -> Result<Scope> {
    match name {
        "Tags" => Ok(Scope::Tags),
        "Fields" => Ok(Scope::Fields),
        "Doc" => Ok(Scope::Doc),
        other => bail!("unknown template scope {other:?}"),
    }
}

fn bson_text(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(f) => f.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::DateTime(dt) => dt.to_chrono().to_rfc3339(),
        other => other.to_string(),
    }
}
