//! Lazy property references, rendered against a bag when a step runs
//!
//! Template syntax:
//! - `%(prop:NAME)s` - property value, empty when unset
//! - `%(prop:NAME:-DEFAULT)s` - DEFAULT when unset
//! - `%(prop:NAME:~DEFAULT)s` - DEFAULT when unset or falsy
//! - `%(now:FORMAT)s` - current UTC time, strftime FORMAT

use crate::core::properties::{PropertyBag, PropertyValue};
use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::OnceLock;
use thiserror::Error;

/// Template errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("unterminated placeholder in template '{0}'")]
    Unterminated(String),

    #[error("unknown placeholder kind '{kind}' in template '{template}'")]
    UnknownKind { kind: String, template: String },

    #[error("empty property name in template '{0}'")]
    EmptyName(String),

    #[error("invalid time format '{0}'")]
    BadTimeFormat(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Fallback {
    IfUnset(String),
    IfFalsy(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Prop { name: String, fallback: Option<Fallback> },
    Now(String),
}

/// A parsed interpolation template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\(([a-z]+):([^)]*)\)s").expect("placeholder pattern is valid"))
}

impl Template {
    /// Parse a template string
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(source) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            Self::push_literal(&mut segments, &source[last..whole.start()], source)?;
            last = whole.end();

            let kind = &caps[1];
            let body = &caps[2];
            let segment = match kind {
                "prop" => Self::parse_prop(body, source)?,
                "now" => Self::parse_now(body)?,
                other => {
                    return Err(RenderError::UnknownKind {
                        kind: other.to_string(),
                        template: source.to_string(),
                    })
                }
            };
            segments.push(segment);
        }
        Self::push_literal(&mut segments, &source[last..], source)?;

        Ok(Self { segments })
    }

    fn push_literal(segments: &mut Vec<Segment>, text: &str, source: &str) -> Result<(), RenderError> {
        if text.contains("%(") {
            return Err(RenderError::Unterminated(source.to_string()));
        }
        if !text.is_empty() {
            segments.push(Segment::Literal(text.to_string()));
        }
        Ok(())
    }

    fn parse_prop(body: &str, source: &str) -> Result<Segment, RenderError> {
        // the first operator ends the name, anything after it is the default
        let operator = [":-", ":~"]
            .into_iter()
            .filter_map(|op| body.find(op).map(|at| (at, op)))
            .min();
        let (name, fallback) = match operator {
            Some((at, op)) => {
                let default = body[at + op.len()..].to_string();
                let fallback = if op == ":-" {
                    Fallback::IfUnset(default)
                } else {
                    Fallback::IfFalsy(default)
                };
                (&body[..at], Some(fallback))
            }
            None => (body, None),
        };

        if name.trim().is_empty() {
            return Err(RenderError::EmptyName(source.to_string()));
        }

        Ok(Segment::Prop {
            name: name.trim().to_string(),
            fallback,
        })
    }

    fn parse_now(body: &str) -> Result<Segment, RenderError> {
        if StrftimeItems::new(body).any(|item| matches!(item, Item::Error)) {
            return Err(RenderError::BadTimeFormat(body.to_string()));
        }
        Ok(Segment::Now(body.to_string()))
    }

    /// Render against a property bag
    pub fn render(&self, bag: &PropertyBag) -> Result<String, RenderError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Prop { name, fallback } => {
                    let value = bag.get(name);
                    let rendered = match (value, fallback) {
                        (None, Some(Fallback::IfUnset(d))) => d.clone(),
                        (Some(v), Some(Fallback::IfFalsy(d))) if v.is_falsy() => d.clone(),
                        (None, Some(Fallback::IfFalsy(d))) => d.clone(),
                        (Some(v), _) => v.to_string(),
                        (None, None) => String::new(),
                    };
                    out.push_str(&rendered);
                }
                Segment::Now(format) => {
                    write!(out, "{}", chrono::Utc::now().format(format))
                        .map_err(|_| RenderError::BadTimeFormat(format.clone()))?;
                }
            }
        }
        Ok(out)
    }

    /// Names of the properties this template reads
    pub fn referenced_properties(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Prop { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Typed reference to a single property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyRef {
    /// Property to read
    pub property: String,

    /// Used when the property is unset or null
    #[serde(default)]
    pub default: Option<PropertyValue>,

    /// Value substitution table (rendered value -> replacement)
    #[serde(default)]
    pub replace: BTreeMap<String, PropertyValue>,
}

/// A value that is resolved against the property bag at run time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Renderable {
    /// String template (`%(prop:...)s` placeholders)
    Interpolate(String),
    /// Typed property reference
    Property(PropertyRef),
    /// Literal scalar
    Value(PropertyValue),
}

impl Renderable {
    pub fn interpolate(template: impl Into<String>) -> Self {
        Renderable::Interpolate(template.into())
    }

    pub fn property(name: impl Into<String>) -> Self {
        Renderable::Property(PropertyRef {
            property: name.into(),
            default: None,
            replace: BTreeMap::new(),
        })
    }

    pub fn literal(value: impl Into<PropertyValue>) -> Self {
        Renderable::Value(value.into())
    }

    /// Check that the renderable can be rendered at all
    pub fn validate(&self) -> Result<(), RenderError> {
        match self {
            Renderable::Interpolate(t) => Template::parse(t).map(|_| ()),
            Renderable::Property(r) if r.property.trim().is_empty() => {
                Err(RenderError::EmptyName(r.property.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Resolve to a value
    pub fn render(&self, bag: &PropertyBag) -> Result<PropertyValue, RenderError> {
        match self {
            Renderable::Interpolate(t) => Ok(PropertyValue::String(Template::parse(t)?.render(bag)?)),
            Renderable::Property(r) => {
                let value = match bag.get(&r.property) {
                    Some(v) if !v.is_null() => v.clone(),
                    _ => r.default.clone().unwrap_or(PropertyValue::Null),
                };
                Ok(r.replace.get(&value.to_string()).cloned().unwrap_or(value))
            }
            Renderable::Value(v) => Ok(v.clone()),
        }
    }

    /// Resolve to a string (null renders as empty)
    pub fn render_string(&self, bag: &PropertyBag) -> Result<String, RenderError> {
        self.render(bag).map(|v| v.to_string())
    }

    /// Names of the properties this renderable reads
    pub fn referenced_properties(&self) -> Vec<String> {
        match self {
            Renderable::Interpolate(t) => Template::parse(t)
                .map(|t| t.referenced_properties().into_iter().map(String::from).collect())
                .unwrap_or_default(),
            Renderable::Property(r) => vec![r.property.clone()],
            Renderable::Value(_) => Vec::new(),
        }
    }
}

impl From<&str> for Renderable {
    fn from(s: &str) -> Self {
        Renderable::interpolate(s)
    }
}
