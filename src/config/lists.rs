//! List-valued keys that also accept a single scalar.
//!
//! Environment values are typed before they are split, so
//! `SCAN_RELAY__MUTATION__PERMANENT_EXIT_CODES=64` arrives as an integer rather
//! than a one-element list. These deserializers take either form.

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A sequence as-is, any other value as a one-element list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

/// `mutation.args`: words may arrive typed as numbers or booleans
pub(super) fn words<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    one_or_many(deserializer)?
        .into_iter()
        .map(|value| match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(D::Error::custom(format!(
                "Expected a command-line argument, found: {other}"
            ))),
        })
        .collect()
}

/// `mutation.permanent_exit_codes`: codes may arrive as strings after splitting
pub(super) fn exit_codes<'de, D>(deserializer: D) -> Result<Vec<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    one_or_many(deserializer)?
        .into_iter()
        .map(|value| {
            let code = match &value {
                Value::Number(n) => n.as_i64().and_then(|i| i32::try_from(i).ok()),
                Value::String(s) => s.trim().parse::<i32>().ok(),
                _ => None,
            };
            code.ok_or_else(|| D::Error::custom(format!("Invalid exit code: {value}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Lists {
        #[serde(deserialize_with = "words")]
        args: Vec<String>,
        #[serde(deserialize_with = "exit_codes")]
        codes: Vec<i32>,
    }

    fn lists(value: serde_json::Value) -> Result<Lists, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn test_scalars_become_single_element_lists() {
        let parsed = lists(json!({ "args": 42, "codes": 64 })).unwrap();
        assert_eq!(parsed.args, vec!["42"]);
        assert_eq!(parsed.codes, vec![64]);

        let parsed = lists(json!({ "args": "S500.js", "codes": "64" })).unwrap();
        assert_eq!(parsed.args, vec!["S500.js"]);
        assert_eq!(parsed.codes, vec![64]);
    }

    #[test]
    fn test_lists_accept_mixed_element_types() {
        let parsed = lists(json!({ "args": ["--db", 7, true], "codes": ["64", 70] })).unwrap();
        assert_eq!(parsed.args, vec!["--db", "7", "true"]);
        assert_eq!(parsed.codes, vec![64, 70]);
    }

    #[test]
    fn test_exit_codes_reject_non_numeric_values() {
        assert!(lists(json!({ "args": [], "codes": "sixty-four" })).is_err());
        assert!(lists(json!({ "args": [], "codes": [4_294_967_296_u64] })).is_err());
    }
}
