//! Build properties - the per-run key/value bag

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A scalar property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Whether the value counts as "false" for `%(prop:x:~default)s`
    pub fn is_falsy(&self) -> bool {
        match self {
            PropertyValue::Null => true,
            PropertyValue::Bool(b) => !b,
            PropertyValue::Int(i) => *i == 0,
            PropertyValue::Float(f) => *f == 0.0,
            PropertyValue::String(s) => s.is_empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Value of an environment variable; null means the variable is unset
    pub fn as_env_value(&self) -> Option<String> {
        match self {
            PropertyValue::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => Ok(()),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

/// A property together with where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value: PropertyValue,

    /// Who wrote the value last (e.g. "Scheduler", "Trigger", a step name)
    pub source: String,
}

/// Mutable property bag scoped to one build invocation
///
/// Last write wins. Any step may introduce new keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    properties: BTreeMap<String, Property>,
}

impl PropertyBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bag from key/value pairs, all tagged with the same source
    pub fn from_pairs<I, K, V>(pairs: I, source: &str) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let mut bag = Self::new();
        for (key, value) in pairs {
            bag.set(key, value, source);
        }
        bag
    }

    /// Set a property
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>, source: &str) {
        self.properties.insert(
            key.into(),
            Property {
                value: value.into(),
                source: source.to_string(),
            },
        );
    }

    /// Set a property only if the key is not present yet
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>, source: &str) {
        let key = key.into();
        if !self.properties.contains_key(&key) {
            self.set(key, value, source);
        }
    }

    /// Get a property value
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key).map(|p| &p.value)
    }

    /// Get a property value as a string, if it is one
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    /// Get the source that last wrote a property
    pub fn source(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|p| p.source.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.properties.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter().map(|(k, p)| (k, &p.value))
    }

    /// Keep only the listed keys; listed keys absent from the bag stay absent
    pub fn restrict<S: AsRef<str>>(&self, keys: &[S]) -> PropertyBag {
        let properties = keys
            .iter()
            .filter_map(|k| {
                self.properties
                    .get_key_value(k.as_ref())
                    .map(|(k, p)| (k.clone(), p.clone()))
            })
            .collect();
        PropertyBag { properties }
    }

    /// Merge another bag on top of this one (other wins on collision)
    pub fn merge(&mut self, other: &PropertyBag) {
        for (key, property) in &other.properties {
            self.properties.insert(key.clone(), property.clone());
        }
    }

    /// Compute the initial bag of a triggered child
    ///
    /// The result is `restrict(copy_keys) ∪ overrides`, overrides winning.
    pub fn forward<S: AsRef<str>>(
        &self,
        copy_keys: &[S],
        overrides: &BTreeMap<String, PropertyValue>,
    ) -> PropertyBag {
        let mut child = self.restrict(copy_keys);
        for (key, value) in overrides {
            child.set(key.clone(), value.clone(), "Trigger");
        }
        child
    }

    /// Flatten into a plain string map (null values rendered as empty)
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
    }
}
