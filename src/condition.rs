//! # Conditions and Value Comparison
//!
//! Predicate helpers shared by the boolean-producing nodes (`Comparison`, `Logic`,
//! `IsTrue`, `NotNull`, `NotEmpty`), the branching nodes (`Decision`, `Switch`) and the
//! in-memory query evaluator.
//!
//! Truthiness is strict: only the JSON boolean `true` counts as true. Absent values,
//! numbers and strings are all false.
//!
//! ```rust
//! use flowgraph_rs::condition::{ComparisonOperator, LogicOperator};
//! use serde_json::json;
//!
//! assert!(ComparisonOperator::Greater.apply(&json!(5), &json!(3)));
//! assert!(!ComparisonOperator::Greater.apply(&json!(3), &json!(5)));
//! assert!(LogicOperator::Or.combine(&[false, true]));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators for `Comparison` nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl ComparisonOperator {
    /// Apply the operator to `left` and `right`.
    ///
    /// Equality uses [`loose_eq`]. Ordering operators compare numbers numerically and
    /// strings lexically; any other pairing yields `false`.
    pub fn apply(&self, left: &Value, right: &Value) -> bool {
        match self {
            ComparisonOperator::Equal => loose_eq(left, right),
            ComparisonOperator::NotEqual => !loose_eq(left, right),
            ComparisonOperator::Greater => compare_values(left, right) == Some(Ordering::Greater),
            ComparisonOperator::GreaterOrEqual => matches!(
                compare_values(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ComparisonOperator::Less => compare_values(left, right) == Some(Ordering::Less),
            ComparisonOperator::LessOrEqual => matches!(
                compare_values(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::Greater => ">",
            ComparisonOperator::GreaterOrEqual => ">=",
            ComparisonOperator::Less => "<",
            ComparisonOperator::LessOrEqual => "<=",
        }
    }
}

/// Logical operators for `Logic` nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicOperator {
    And,
    Or,
    Not,
}

impl LogicOperator {
    /// Combine already evaluated inputs.
    ///
    /// `Not` negates the conjunction of its inputs. No inputs always yields `false`.
    pub fn combine(&self, inputs: &[bool]) -> bool {
        if inputs.is_empty() {
            return false;
        }
        match self {
            LogicOperator::And => inputs.iter().all(|v| *v),
            LogicOperator::Or => inputs.iter().any(|v| *v),
            LogicOperator::Not => !inputs.iter().all(|v| *v),
        }
    }
}

/// Strict truthiness: only `true` is true
pub fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

/// Null, empty strings, empty arrays and empty objects are empty
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Equality that tolerates a string literal on one side.
///
/// Numbers compare by numeric value, so `1` equals `1.0`. A string equals a number or
/// boolean when it is that value's canonical text (`"5"` equals `5`).
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::String(s), other @ (Value::Number(_) | Value::Bool(_)))
        | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(s)) => {
            *s == other.to_string()
        }
        _ => left == right,
    }
}

/// Order two values of the same scalar type
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl fmt::Display for LogicOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicOperator::And => write!(f, "&&"),
            LogicOperator::Or => write!(f, "||"),
            LogicOperator::Not => write!(f, "!"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_comparison_operators() {
        assert!(ComparisonOperator::Equal.apply(&json!(1), &json!(1.0)));
        assert!(ComparisonOperator::Equal.apply(&json!("5"), &json!(5)));
        assert!(ComparisonOperator::NotEqual.apply(&json!("a"), &json!("b")));
        assert!(ComparisonOperator::GreaterOrEqual.apply(&json!(3), &json!(3)));
        assert!(ComparisonOperator::Less.apply(&json!("apple"), &json!("banana")));
        assert!(ComparisonOperator::LessOrEqual.apply(&json!(-1), &json!(0)));
    }

    #[test]
    fn test_ordering_with_mixed_types_is_false() {
        assert!(!ComparisonOperator::Greater.apply(&json!(5), &Value::Null));
        assert!(!ComparisonOperator::Less.apply(&json!("5"), &json!(7)));
        assert!(ComparisonOperator::Equal.apply(&Value::Null, &Value::Null));
    }

    #[test]
    fn test_logic_combination() {
        assert!(LogicOperator::And.combine(&[true, true]));
        assert!(!LogicOperator::And.combine(&[true, false]));
        assert!(LogicOperator::Or.combine(&[false, true]));
        assert!(LogicOperator::Not.combine(&[false]));
        assert!(!LogicOperator::Not.combine(&[true]));
        assert!(!LogicOperator::And.combine(&[]));
        assert!(!LogicOperator::Not.combine(&[]));
    }

    #[test]
    fn test_truthiness_and_emptiness() {
        assert!(is_true(&json!(true)));
        assert!(!is_true(&json!("true")));
        assert!(!is_true(&json!(1)));
        assert!(is_empty(&json!([])));
        assert!(is_empty(&json!("")));
        assert!(!is_empty(&json!(0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ComparisonOperator::GreaterOrEqual.to_string(), ">=");
        assert_eq!(LogicOperator::Or.to_string(), "||");
    }
}
