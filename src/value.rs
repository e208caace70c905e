//! Field values and composite object keys

use chrono::{DateTime, TimeZone, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;

/// Value held by one field of a persistent object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldValue {
    /// Field present but unset. Distinct from `Text(String::new())`.
    #[default]
    Empty,
    Text(String),
    Time(DateTime<Utc>),
    /// Multi-valued caller input. Never stored: `set` rejects it.
    List(Vec<String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Text form used in the `_custom` and `_change` tables.
    pub fn to_stored(&self) -> Option<String> {
        match self {
            FieldValue::Empty => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Time(t) => Some(to_timestamp(t).to_string()),
            FieldValue::List(items) => Some(items.join("|")),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Empty => Ok(()),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
            FieldValue::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&String> for FieldValue {
    fn from(s: &String) -> Self {
        FieldValue::Text(s.clone())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(t: DateTime<Utc>) -> Self {
        FieldValue::Time(t)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        FieldValue::List(items)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Empty)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldValue::Empty => serializer.serialize_none(),
            FieldValue::Text(s) => serializer.serialize_str(s),
            FieldValue::Time(t) => serializer.serialize_str(&t.to_rfc3339()),
            FieldValue::List(items) => items.serialize(serializer),
        }
    }
}

/// Microseconds since the epoch, the on-disk form of time fields.
pub fn to_timestamp(t: &DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub fn from_timestamp(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single()
}

/// Current time truncated to the stored precision, so values read back
/// compare equal to the ones written.
pub fn now() -> DateTime<Utc> {
    let t = Utc::now();
    from_timestamp(to_timestamp(&t)).unwrap_or(t)
}

/// Ordered key-column → value mapping identifying one object in its realm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectKey {
    parts: Vec<(String, String)>,
}

impl ObjectKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-column key on `id`, the common case.
    pub fn id(value: impl Into<String>) -> Self {
        Self::new().with("id", value)
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        let column = column.into();
        let value = value.into();
        match self.parts.iter_mut().find(|(c, _)| *c == column) {
            Some(part) => part.1 = value,
            None => self.parts.push((column, value)),
        }
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.parts
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Parse `col=value` pairs, as typed on the command line.
    pub fn parse_pairs<'a, I>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut key = ObjectKey::new();
        for pair in pairs {
            let (column, value) = pair.split_once('=')?;
            key = key.with(column.trim(), value.trim());
        }
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// JSON object string in key-column order; stable for caches and URLs.
    pub fn to_key_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for ObjectKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.parts.len()))?;
        for (column, value) in &self.parts {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key_string())
    }
}
