//! Dotted paths into nested source records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// An ordered key path such as `address.city` or `contacts.0.email`.
///
/// Each step tries an exact key, then a case-insensitive key. A numeric step
/// indexes into an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn resolve<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        self.segments.iter().try_fold(record, |current, segment| step(current, segment))
    }
}

fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment).or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(segment))
                .map(|(_, v)| v)
        }),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

impl FromStr for FieldPath {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IngestError::Config("field path is empty".into()));
        }

        let segments: Vec<String> = trimmed.split('.').map(|p| p.trim().to_string()).collect();
        if segments.iter().any(String::is_empty) {
            return Err(IngestError::Config(format!("field path '{}' has an empty segment", s)));
        }

        Ok(Self { segments })
    }
}

impl TryFrom<String> for FieldPath {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}
