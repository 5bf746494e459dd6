//! Published measurement snapshot
//!
//! A [`Snapshot`] is built privately by one poll cycle and then published as a
//! whole; consumers only ever see complete snapshots. Keys whose batch failed
//! during the cycle are absent, which is different from a key that was read
//! but carried a NaN pattern ([`Reading::Unavailable`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    /// Rounded value in the descriptor's unit.
    Value(f64),
    /// The meter reported NaN for this register pair.
    Unavailable,
}

impl Reading {
    /// Numeric value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

/// Readings of one completed poll cycle, keyed by register key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    values: BTreeMap<String, Reading>,
    taken_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// The empty snapshot published before the first successful cycle.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn new(values: BTreeMap<String, Reading>, taken_at: DateTime<Utc>) -> Self {
        Self {
            values,
            taken_at: Some(taken_at),
        }
    }

    /// `None` means the key was not read in this cycle.
    pub fn get(&self, key: &str) -> Option<Reading> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Completion time of the cycle that produced this snapshot.
    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Reading)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
