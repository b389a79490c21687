//! # Conservation Validator
//!
//! No transition may create or destroy value. The validator sums the
//! conserved amount of every key before and after a proposed transition and
//! accepts only if the totals are equal.
//!
//! Amounts are integers (see [`crate::value`]), so "equal" means exactly
//! equal. Only the keys a transition touches can move the total, so the
//! after-total is derived from the before-total plus the touched keys'
//! deltas instead of re-summing the whole state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::merkle::MerkleTree;
use crate::transition::StateTransition;
use crate::value::{Conserved, Value};

/// Detailed outcome of a conservation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConservationReport {
    pub valid: bool,
    pub total_before: i128,
    pub total_after: i128,
    /// `total_after - total_before`. Zero when valid.
    pub violation: i128,
    pub message: String,
}

/// Stateless conservation checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservationValidator;

impl ConservationValidator {
    pub fn new() -> Self {
        Self
    }

    /// `true` iff applying `transition` to `current_state` keeps total value.
    pub fn validate(
        &self,
        transition: &StateTransition,
        current_state: &BTreeMap<String, Value>,
    ) -> bool {
        self.validate_detailed(transition, current_state).valid
    }

    /// Like [`validate`](Self::validate), with totals and a diagnostic.
    ///
    /// A total that overflows `i128` is reported as a violation.
    pub fn validate_detailed(
        &self,
        transition: &StateTransition,
        current_state: &BTreeMap<String, Value>,
    ) -> ConservationReport {
        let Some(total_before) = sum_amounts(current_state.values()) else {
            return overflow_report(0);
        };

        let mut total_after = Some(total_before);
        for (key, new) in transition.iter() {
            let old = current_state.get(key).conserved_amount();
            total_after = total_after
                .and_then(|t| t.checked_sub(old))
                .and_then(|t| t.checked_add(new.conserved_amount()));
        }
        let Some(total_after) = total_after else {
            return overflow_report(total_before);
        };

        let violation = total_after - total_before;
        if violation == 0 {
            ConservationReport {
                valid: true,
                total_before,
                total_after,
                violation,
                message: format!("conservation holds: total {total_before}"),
            }
        } else {
            ConservationReport {
                valid: false,
                total_before,
                total_after,
                violation,
                message: format!(
                    "total value would change from {total_before} to {total_after} ({violation:+})"
                ),
            }
        }
    }

    /// Sum of conserved amounts over every key in `tree`, saturating at the
    /// `i128` bounds.
    pub fn calculate_total_value(tree: &MerkleTree) -> i128 {
        tree.entries()
            .values()
            .fold(0i128, |acc, v| acc.saturating_add(v.conserved_amount()))
    }

    /// Total of a plain key/value map. `None` on overflow.
    pub fn total_of(state: &BTreeMap<String, Value>) -> Option<i128> {
        sum_amounts(state.values())
    }
}

fn sum_amounts<'a>(mut values: impl Iterator<Item = &'a Value>) -> Option<i128> {
    values.try_fold(0i128, |acc, v| acc.checked_add(v.conserved_amount()))
}

fn overflow_report(total_before: i128) -> ConservationReport {
    ConservationReport {
        valid: false,
        total_before,
        total_after: total_before,
        violation: 0,
        message: "total value overflows the accounting range".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn alice_bob() -> BTreeMap<String, Value> {
        state(&[("alice", Value::account(100)), ("bob", Value::account(100))])
    }

    #[test]
    fn balanced_transfer_is_valid() {
        let t = StateTransition::new()
            .with("alice", Value::account(50))
            .with("bob", Value::account(150));
        let report = ConservationValidator::new().validate_detailed(&t, &alice_bob());
        assert!(report.valid);
        assert_eq!(report.total_before, 200);
        assert_eq!(report.total_after, 200);
        assert_eq!(report.violation, 0);
    }

    #[test]
    fn minting_is_a_violation() {
        let t = StateTransition::new()
            .with("alice", Value::account(100))
            .with("bob", Value::account(200));
        let report = ConservationValidator::new().validate_detailed(&t, &alice_bob());
        assert!(!report.valid);
        assert_eq!(report.violation, 100);
        assert!(report.message.contains("200 to 300"));
    }

    #[test]
    fn new_key_with_value_is_a_violation() {
        let t = StateTransition::new().with("carol", Value::Number(1));
        assert!(!ConservationValidator::new().validate(&t, &alice_bob()));
    }

    #[test]
    fn moving_value_between_shapes_is_fine() {
        let current = state(&[
            ("pool", Value::Number(70)),
            ("escrow", Value::account_with(30, [("owner".to_string(), json!("bob"))])),
        ]);
        let t = StateTransition::new()
            .with("pool", Value::Number(0))
            .with("escrow", Value::from_json(json!({"amount": 100, "owner": "bob"})).unwrap());
        assert!(ConservationValidator::new().validate(&t, &current));
    }

    #[test]
    fn opaque_values_carry_nothing() {
        let t = StateTransition::new().with("memo", Value::opaque(&json!("hello")).unwrap());
        assert!(ConservationValidator::new().validate(&t, &alice_bob()));
    }

    #[test]
    fn overflow_is_reported_not_panicked() {
        let current = state(&[("a", Value::Number(i128::MAX))]);
        let t = StateTransition::new().with("b", Value::Number(1));
        let report = ConservationValidator::new().validate_detailed(&t, &current);
        assert!(!report.valid);
        assert!(report.message.contains("overflow"));
    }

    #[test]
    fn tree_total_uses_same_extraction() {
        let tree = MerkleTree::from_entries(state(&[
            ("alice", Value::account(60)),
            ("bob", Value::Number(40)),
            ("note", Value::from_json(json!({"x": [1, 2]})).unwrap()),
        ]));
        assert_eq!(ConservationValidator::calculate_total_value(&tree), 100);
    }
}
