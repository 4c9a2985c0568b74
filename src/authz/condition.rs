use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};

/// Request attributes a condition is matched against.
pub type Attributes = HashMap<String, Value>;

/// Evaluates the flat equality conditions attached to a grant.
///
/// A condition is a JSON object of `key -> expected value`. Every key must be
/// present in the attributes and compare equal after string normalization,
/// so `{"level": 3}` matches an attribute of `"3"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// `Ok(true)` for an absent or empty condition. A malformed condition is an
    /// error, which callers must treat as a deny.
    pub fn evaluate(&self, condition: Option<&str>, attributes: &Attributes) -> AppResult<bool> {
        let raw = match condition.map(str::trim) {
            None | Some("") => return Ok(true),
            Some(raw) => raw,
        };

        let expected = Self::parse(raw)?;
        for (key, want) in &expected {
            let want = normalize(want)
                .ok_or_else(|| AppError::condition(format!("condition value for {key} is not a scalar")))?;

            let Some(got) = attributes.get(key) else {
                tracing::debug!(condition_key = %key, "condition attribute missing");
                return Ok(false);
            };

            if normalize(got).as_deref() != Some(want.as_str()) {
                tracing::debug!(condition_key = %key, "condition attribute mismatch");
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn parse(raw: &str) -> AppResult<Map<String, Value>> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(Value::Null) => Ok(Map::new()),
            Ok(_) => Err(AppError::condition("condition must be a JSON object")),
            Err(err) => Err(AppError::condition(format!("malformed condition: {err}"))),
        }
    }
}

/// Scalars compare by their string form; arrays and objects never match.
fn normalize(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_absent_condition_is_unconditional() {
        let evaluator = ConditionEvaluator::new();
        assert!(evaluator.evaluate(None, &Attributes::new()).unwrap());
        assert!(evaluator.evaluate(Some("  "), &Attributes::new()).unwrap());
        assert!(evaluator.evaluate(Some("{}"), &Attributes::new()).unwrap());
    }

    #[test]
    fn test_all_keys_must_match() {
        let evaluator = ConditionEvaluator::new();
        let condition = Some(r#"{"department":"eng","region":"eu"}"#);

        let matching = attrs(&[("department", json!("eng")), ("region", json!("eu")), ("extra", json!(1))]);
        assert!(evaluator.evaluate(condition, &matching).unwrap());

        let mismatch = attrs(&[("department", json!("sales")), ("region", json!("eu"))]);
        assert!(!evaluator.evaluate(condition, &mismatch).unwrap());

        let missing = attrs(&[("department", json!("eng"))]);
        assert!(!evaluator.evaluate(condition, &missing).unwrap());
    }

    #[test]
    fn test_string_normalized_comparison() {
        let evaluator = ConditionEvaluator::new();
        assert!(evaluator
            .evaluate(Some(r#"{"level": 3}"#), &attrs(&[("level", json!("3"))]))
            .unwrap());
        assert!(evaluator
            .evaluate(Some(r#"{"verified": "true"}"#), &attrs(&[("verified", json!(true))]))
            .unwrap());
        assert!(!evaluator
            .evaluate(Some(r#"{"tags": "a"}"#), &attrs(&[("tags", json!(["a"]))]))
            .unwrap());
    }

    #[test]
    fn test_malformed_condition_is_error() {
        let evaluator = ConditionEvaluator::new();
        let err = evaluator.evaluate(Some("{not json"), &Attributes::new()).unwrap_err();
        assert!(matches!(err, AppError::Condition(_)));

        assert!(evaluator.evaluate(Some(r#"["eng"]"#), &Attributes::new()).is_err());
        assert!(evaluator
            .evaluate(Some(r#"{"nested": {"a": 1}}"#), &Attributes::new())
            .is_err());
    }
}
