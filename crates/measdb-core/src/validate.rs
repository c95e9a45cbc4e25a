//! Parameter-spec graph and result-row validation.

use std::collections::{HashMap, HashSet};

use crate::error::{MeasdbError, Result};
use crate::models::{ParamSpec, ParamType, ResultRow, Value};

/// Column names every result table already uses.
const RESERVED_NAMES: [&str; 2] = ["id", "timestamp"];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check that `specs` form a well-formed dependency graph.
///
/// Every `depends_on` / `inferred_from` edge must point at a spec registered
/// earlier in the list, so the graph is acyclic by construction.
/// An empty list is a valid (empty) graph.
pub fn validate_specs(specs: &[ParamSpec]) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for spec in specs {
        let name = spec.name.as_str();
        if !is_identifier(name) {
            return Err(MeasdbError::InvalidSpec(format!(
                "'{name}' is not a valid parameter name"
            )));
        }
        if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(MeasdbError::InvalidSpec(format!("'{name}' is a reserved name")));
        }
        // SQLite identifiers are case-insensitive.
        if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return Err(MeasdbError::InvalidSpec(format!("duplicate parameter '{name}'")));
        }

        for (kind, edges) in [("depends_on", &spec.depends_on), ("inferred_from", &spec.inferred_from)] {
            let mut local: HashSet<&str> = HashSet::new();
            for target in edges {
                if target == name {
                    return Err(MeasdbError::InvalidSpec(format!(
                        "'{name}' lists itself in {kind}"
                    )));
                }
                if !local.insert(target.as_str()) {
                    return Err(MeasdbError::InvalidSpec(format!(
                        "'{name}' lists '{target}' twice in {kind}"
                    )));
                }
                if !seen.contains(target.as_str()) {
                    return Err(MeasdbError::InvalidSpec(format!(
                        "'{name}' {kind} '{target}', which is not registered before it"
                    )));
                }
            }
        }

        seen.insert(name);
    }
    Ok(())
}

/// A run's parameter specs with a name index, used to check rows.
#[derive(Debug, Clone)]
pub struct Layout {
    specs: Vec<ParamSpec>,
    index: HashMap<String, usize>,
}

impl Layout {
    /// Validate `specs` and build the index.
    pub fn new(specs: Vec<ParamSpec>) -> Result<Self> {
        validate_specs(&specs)?;
        Ok(Self::from_trusted(specs))
    }

    /// Build from specs already validated (e.g. loaded from the store).
    pub(crate) fn from_trusted(specs: Vec<ParamSpec>) -> Self {
        let index = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { specs, index }
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Check one row. `row_idx` is the row's index within its batch and is
    /// only used for the error message.
    pub fn validate_row(&self, row_idx: usize, row: &ResultRow) -> Result<()> {
        let mismatch = |reason: String| MeasdbError::RowShapeMismatch { row: row_idx, reason };

        if row.values.is_empty() {
            return Err(mismatch("row has no values".into()));
        }

        for (name, value) in &row.values {
            let Some(pos) = self.position(name) else {
                return Err(mismatch(format!("unknown parameter '{name}'")));
            };
            let spec = &self.specs[pos];
            if value.param_type() != spec.param_type {
                return Err(mismatch(format!(
                    "'{name}' is {} but got a {} value",
                    spec.param_type,
                    value.param_type()
                )));
            }
            if let Value::Array(arr) = value {
                if !arr.is_well_formed() {
                    return Err(mismatch(format!(
                        "'{name}' has shape {:?} but {} elements",
                        arr.shape(),
                        arr.len()
                    )));
                }
            }

            for setpoint in &spec.depends_on {
                let Some(sp_value) = row.values.get(setpoint) else {
                    return Err(mismatch(format!(
                        "'{name}' depends on '{setpoint}', which is missing"
                    )));
                };
                if let (Value::Array(dep), Value::Array(sp)) = (value, sp_value) {
                    if dep.shape() != sp.shape() {
                        return Err(mismatch(format!(
                            "'{name}' has shape {:?} but setpoint '{setpoint}' has shape {:?}",
                            dep.shape(),
                            sp.shape()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Check a whole batch; the first bad row fails it.
    pub fn validate_rows(&self, rows: &[ResultRow]) -> Result<()> {
        rows.iter()
            .enumerate()
            .try_for_each(|(i, row)| self.validate_row(i, row))
    }

    pub(crate) fn param_type(&self, pos: usize) -> ParamType {
        self.specs[pos].param_type
    }
}
