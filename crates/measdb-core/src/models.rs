//! Data models for measdb.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeasdbError, Result};

/// Free-form run metadata (string keys, JSON values).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Kind of value a parameter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Numeric,
    Array,
    Text,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Numeric => "numeric",
            ParamType::Array => "array",
            ParamType::Text => "text",
        }
    }

    /// SQLite column type used in per-run result tables.
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            ParamType::Numeric => "REAL",
            ParamType::Array => "BLOB",
            ParamType::Text => "TEXT",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamType {
    type Err = MeasdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "numeric" => Ok(ParamType::Numeric),
            "array" => Ok(ParamType::Array),
            "text" => Ok(ParamType::Text),
            other => Err(MeasdbError::Corrupt(format!("unknown parameter type '{other}'"))),
        }
    }
}

/// Descriptor of one measured or set variable.
///
/// `depends_on` lists the setpoints a measured value is a function of;
/// `inferred_from` lists parameters it was computed from. Both may only name
/// specs registered earlier in the same run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inferred_from: Vec<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            label: String::new(),
            unit: String::new(),
            depends_on: Vec::new(),
            inferred_from: Vec::new(),
        }
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Numeric)
    }

    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Array)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Text)
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn inferred_from<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inferred_from = names.into_iter().map(Into::into).collect();
        self
    }

    /// True when this parameter is a function of setpoints.
    pub fn is_dependent(&self) -> bool {
        !self.depends_on.is_empty()
    }
}

/// An n-dimensional array of `f64` stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl ArrayValue {
    /// Build an array, checking that the shape covers the data exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected = element_count(&shape).ok_or_else(|| {
            MeasdbError::Other(format!("array shape {:?} overflows usize", shape))
        })?;
        if expected != data.len() {
            return Err(MeasdbError::Other(format!(
                "array shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A flat vector becomes a one-dimensional array.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    /// Build without the shape check.
    #[cfg(test)]
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        element_count(&self.shape) == Some(self.data.len())
    }
}

/// Product of the dimensions, or `None` on overflow.
fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// A single recorded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Numeric(f64),
    Array(ArrayValue),
    Text(String),
}

impl Value {
    pub fn param_type(&self) -> ParamType {
        match self {
            Value::Numeric(_) => ParamType::Numeric,
            Value::Array(_) => ParamType::Array,
            Value::Text(_) => ParamType::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Numeric(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Numeric(v as f64)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Numeric(v as f64)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Numeric(v as f64)
    }
}
impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(ArrayValue::from_vec(v))
    }
}
impl From<ArrayValue> for Value {
    fn from(v: ArrayValue) -> Self {
        Value::Array(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// One recorded tuple of parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, Value>,
}

impl ResultRow {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            values,
        }
    }

    /// Convenience constructor from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Created,
    Writing,
    Completed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::Writing => "WRITING",
            RunState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = MeasdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(RunState::Created),
            "WRITING" => Ok(RunState::Writing),
            "COMPLETED" => Ok(RunState::Completed),
            other => Err(MeasdbError::Corrupt(format!("unknown run state '{other}'"))),
        }
    }
}

/// A run with its full parameter layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: i64,
    pub guid: String,
    pub name: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Parameter specs in registration order.
    pub specs: Vec<ParamSpec>,
    pub metadata: Metadata,
    pub result_count: u64,
}

impl Run {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Wall time between start and completion, if both are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// A row of the run listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub guid: String,
    pub name: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_shape_must_cover_data() {
        assert!(ArrayValue::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(ArrayValue::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(ArrayValue::new(vec![], vec![1.0]).is_ok());
    }

    #[test]
    fn overflowing_shape_is_an_error() {
        assert!(ArrayValue::new(vec![usize::MAX, 2], vec![]).is_err());
        assert!(!ArrayValue::from_parts(vec![usize::MAX, 2], vec![]).is_well_formed());
    }
}
