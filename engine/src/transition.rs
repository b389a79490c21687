//! # State Transitions
//!
//! A [`StateTransition`] is the unit callers hand to the store: a batch of
//! key updates applied all-or-nothing. Each update carries the key's *final*
//! value, not a delta. A key that appears twice keeps its last value.
//!
//! Transitions arrive already approved by the logic-verification layer. The
//! engine never re-derives their meaning; it only checks that they are
//! well-formed, representable and value-conserving.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SPENT_PREFIX;
use crate::error::{EngineError, EngineResult};
use crate::value::Value;

// ---------------------------------------------------------------------------
// OutputRef
// ---------------------------------------------------------------------------

/// A spendable output: output `output_index` of transaction `txid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub txid: String,
    pub output_index: u32,
}

impl OutputRef {
    pub fn new(txid: impl Into<String>, output_index: u32) -> Self {
        Self {
            txid: txid.into(),
            output_index,
        }
    }

    /// Merkle key recording that this output is spent.
    pub fn spent_key(&self) -> String {
        format!("{SPENT_PREFIX}{}:{}", self.txid, self.output_index)
    }

    /// Inverse of [`spent_key`](Self::spent_key). The txid may itself contain
    /// `:`; the index is whatever follows the last one.
    pub fn from_spent_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(SPENT_PREFIX)?;
        let (txid, index) = rest.rsplit_once(':')?;
        if txid.is_empty() {
            return None;
        }
        Some(Self::new(txid, index.parse().ok()?))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.output_index)
    }
}

// ---------------------------------------------------------------------------
// StateChange / StateTransition
// ---------------------------------------------------------------------------

/// One key's final value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub key: String,
    pub value: Value,
}

impl StateChange {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A batch of updates committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    changes: BTreeMap<String, Value>,
}

impl StateTransition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.changes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.changes.get(key)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.changes.iter()
    }

    pub fn changes(&self) -> &BTreeMap<String, Value> {
        &self.changes
    }

    pub fn into_changes(self) -> BTreeMap<String, Value> {
        self.changes
    }

    /// Reject keys the store will not accept from callers and values that
    /// cannot be stored.
    ///
    /// Keys must be non-empty and outside the `spent:` namespace, which only
    /// the store itself writes.
    pub fn check_well_formed(&self) -> EngineResult<()> {
        for (key, value) in &self.changes {
            if key.is_empty() {
                return Err(EngineError::InvalidTransition("empty key".to_string()));
            }
            if key.starts_with(SPENT_PREFIX) {
                return Err(EngineError::InvalidTransition(format!(
                    "key {key:?} is in the reserved {SPENT_PREFIX:?} namespace"
                )));
            }
            value.check_representable()?;
        }
        Ok(())
    }
}

impl FromIterator<StateChange> for StateTransition {
    fn from_iter<I: IntoIterator<Item = StateChange>>(iter: I) -> Self {
        let mut transition = Self::new();
        for change in iter {
            transition.set(change.key, change.value);
        }
        transition
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for StateTransition {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut transition = Self::new();
        for (k, v) in iter {
            transition.set(k, v);
        }
        transition
    }
}
