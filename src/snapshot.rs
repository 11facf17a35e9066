//! Name -> value snapshots of a model's variables

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::model::Model;

/// Complete assignment of a model's variables at one instant
///
/// Owned values throughout: cloning a snapshot never aliases the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    values: BTreeMap<String, f64>,
}

impl Snapshot {
    /// Capture every variable the model currently exposes
    pub fn capture<M: Model + ?Sized>(model: &M) -> Result<Self> {
        let mut values = BTreeMap::new();
        for name in model.all_variables() {
            let value = model
                .value(&name)
                .ok_or_else(|| SearchError::unknown_variable(&name))?;
            values.insert(name, value);
        }
        Ok(Self { values })
    }

    /// Load every value back into `model`
    ///
    /// All names are checked before anything is written, so a mismatched
    /// snapshot leaves the model untouched.
    pub fn restore<M: Model + ?Sized>(&self, model: &mut M) -> Result<()> {
        if let Some(missing) = self.values.keys().find(|name| !model.contains(name)) {
            return Err(SearchError::unknown_variable(missing));
        }
        for (name, &value) in &self.values {
            model.set_value(name, value)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Values of `names` in the given order; absent names read as 0
    pub fn feature_vector<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<f64> {
        names
            .into_iter()
            .map(|n| self.get(n).unwrap_or(0.0))
            .collect()
    }

    /// Largest absolute difference over names present in both snapshots
    pub fn max_abs_diff(&self, other: &Snapshot) -> f64 {
        self.values
            .iter()
            .filter_map(|(k, a)| other.values.get(k).map(|b| (a - b).abs()))
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for Snapshot {
    /// Single-line `name=value` dump used by the audit logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={:.10e}", name, value)?;
            first = false;
        }
        Ok(())
    }
}
