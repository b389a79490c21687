//! # State Values
//!
//! Every key in the engine maps to a [`Value`]. The JSON on disk is
//! free-form, but the engine needs to know one thing about every value: how
//! much it contributes to the conserved total. That question is answered by
//! the [`Conserved`] trait rather than by poking at JSON fields wherever an
//! amount is needed.
//!
//! ```text
//! JSON                         Value                 conserved amount
//! ----                         -----                 ----------------
//! 100                          Number(100)           100
//! {"balance": 40, "owner": ..} Account { .. }        40
//! {"amount": 7}                Account { .. }        7
//! {"owner": "x"}               Account { .. }        0
//! "memo" / true / null / [..]  Opaque(bytes)         0
//! ```
//!
//! Amounts are integers. A fractional number where an amount is expected is
//! rejected when the value enters the engine, so conservation is checked with
//! exact arithmetic.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{self, Serialize, Serializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Fields on an account record that carry value, in lookup order.
pub const AMOUNT_FIELDS: [&str; 2] = ["balance", "amount"];

/// Smallest integer that survives a JSON round trip.
pub const MIN_REPRESENTABLE: i128 = i64::MIN as i128;

/// Largest integer that survives a JSON round trip.
pub const MAX_REPRESENTABLE: i128 = u64::MAX as i128;

/// Reasons a value cannot enter durable state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("numeric value {0} is not an integer")]
    NonIntegralNumber(String),

    #[error("account field `{field}` must be an integer, got {value}")]
    NonIntegralAmount { field: String, value: String },

    #[error("integer {0} is outside the representable range")]
    OutOfRange(i128),

    #[error("opaque payload is not valid JSON: {0}")]
    InvalidOpaque(String),

    #[error("opaque payload {0} would reload as a number or record")]
    OpaqueShape(String),
}

/// A state value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A bare amount.
    Number(i128),
    /// A JSON object. Its `balance` (or else `amount`) field is the amount.
    Account {
        /// Object fields, sorted by key.
        fields: BTreeMap<String, JsonValue>,
    },
    /// Anything else, stored as canonical JSON bytes. Never carries value.
    Opaque(Vec<u8>),
}

/// Conservation-extraction interface: how much value something holds.
pub trait Conserved {
    fn conserved_amount(&self) -> i128;
}

impl Conserved for Value {
    fn conserved_amount(&self) -> i128 {
        match self {
            Value::Number(n) => *n,
            Value::Account { fields } => AMOUNT_FIELDS
                .iter()
                .find_map(|f| fields.get(*f))
                .and_then(json_integer)
                .unwrap_or(0),
            Value::Opaque(_) => 0,
        }
    }
}

impl<T: Conserved + ?Sized> Conserved for &T {
    fn conserved_amount(&self) -> i128 {
        (**self).conserved_amount()
    }
}

impl<T: Conserved> Conserved for Option<T> {
    fn conserved_amount(&self) -> i128 {
        self.as_ref().map_or(0, Conserved::conserved_amount)
    }
}

impl Value {
    /// An account record `{"balance": balance}`.
    pub fn account(balance: i64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("balance".to_string(), JsonValue::from(balance));
        Value::Account { fields }
    }

    /// An account record with arbitrary extra fields.
    pub fn account_with(balance: i64, extra: impl IntoIterator<Item = (String, JsonValue)>) -> Self {
        let mut fields: BTreeMap<String, JsonValue> = extra.into_iter().collect();
        fields.insert("balance".to_string(), JsonValue::from(balance));
        Value::Account { fields }
    }

    /// Wrap JSON that carries no value: strings, booleans, null, arrays.
    ///
    /// Numbers and objects are refused. On disk they are indistinguishable
    /// from `Number` and `Account`, and would come back carrying value.
    pub fn opaque(json: &JsonValue) -> Result<Self, ValueError> {
        check_opaque_shape(json)?;
        Ok(Value::Opaque(json.to_string().into_bytes()))
    }

    /// Canonical byte encoding used for Merkle leaf hashing.
    ///
    /// Compact JSON with object keys in sorted order, so two nodes holding the
    /// same value always hash the same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::Number(n) => n.to_string().into_bytes(),
            Value::Account { fields } => serde_json::to_vec(fields).unwrap_or_default(),
            Value::Opaque(bytes) => bytes.clone(),
        }
    }

    /// Check that this value can be written to and read back from disk.
    pub fn check_representable(&self) -> Result<(), ValueError> {
        match self {
            Value::Number(n) if !(MIN_REPRESENTABLE..=MAX_REPRESENTABLE).contains(n) => {
                Err(ValueError::OutOfRange(*n))
            }
            Value::Number(_) => Ok(()),
            Value::Account { fields } => check_amount_fields(fields),
            Value::Opaque(bytes) => serde_json::from_slice::<JsonValue>(bytes)
                .map_err(|e| ValueError::InvalidOpaque(e.to_string()))
                .and_then(|json| check_opaque_shape(&json)),
        }
    }

    /// Decode from a JSON tree.
    pub fn from_json(json: JsonValue) -> Result<Self, ValueError> {
        match json {
            JsonValue::Number(n) => n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .map(Value::Number)
                .ok_or_else(|| ValueError::NonIntegralNumber(n.to_string())),
            JsonValue::Object(map) => {
                let fields: BTreeMap<String, JsonValue> = map.into_iter().collect();
                check_amount_fields(&fields)?;
                Ok(Value::Account { fields })
            }
            other => Ok(Value::Opaque(other.to_string().into_bytes())),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as i128)
    }
}

impl TryFrom<JsonValue> for Value {
    type Error = ValueError;

    fn try_from(json: JsonValue) -> Result<Self, Self::Error> {
        Value::from_json(json)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.canonical_bytes()))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Number(n) => serializer.serialize_i128(*n),
            Value::Account { fields } => fields.serialize(serializer),
            Value::Opaque(bytes) => {
                let json: JsonValue = serde_json::from_slice(bytes).map_err(ser::Error::custom)?;
                json.serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Value::from_json(json).map_err(de::Error::custom)
    }
}

fn check_opaque_shape(json: &JsonValue) -> Result<(), ValueError> {
    match json {
        JsonValue::Number(_) | JsonValue::Object(_) => Err(ValueError::OpaqueShape(json.to_string())),
        _ => Ok(()),
    }
}

fn json_integer(json: &JsonValue) -> Option<i128> {
    json.as_i64()
        .map(i128::from)
        .or_else(|| json.as_u64().map(i128::from))
}

fn check_amount_fields(fields: &BTreeMap<String, JsonValue>) -> Result<(), ValueError> {
    for field in AMOUNT_FIELDS {
        if let Some(v) = fields.get(field) {
            if json_integer(v).is_none() {
                return Err(ValueError::NonIntegralAmount {
                    field: field.to_string(),
                    value: v.to_string(),
                });
            }
        }
    }
    Ok(())
}
