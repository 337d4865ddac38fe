//! Structural value type tags
//!
//! Channel values are held as [`serde_json::Value`] — a polymorphic container
//! keyed by channel id. Each channel declares a *type tag*, a stable string
//! naming the structural shape its values must have, and every read and write
//! is validated against it. Tags are stable across builds of the same schema
//! and participate in the schema version digest.
//!
//! Recognized tags: `"null"`, `"bool"`, `"int"`, `"float"`, `"string"`,
//! `"array"`, `"object"`, and the wildcard `"any"`. An `"int"` value is also
//! acceptable where a `"float"` is expected; the reverse is not.

use serde_json::Value;

/// Wildcard tag matching every value shape
pub const ANY_TAG: &str = "any";

/// Compute the structural type tag of a value
pub fn type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "int"
            } else {
                "float"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check whether a value satisfies an expected type tag
///
/// `"any"` matches everything; `"float"` additionally accepts integral
/// numbers. All other tags require an exact structural match.
pub fn tag_matches(expected: &str, value: &Value) -> bool {
    if expected == ANY_TAG {
        return true;
    }
    let actual = type_tag(value);
    actual == expected || (expected == "float" && actual == "int")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tags() {
        assert_eq!(type_tag(&json!(null)), "null");
        assert_eq!(type_tag(&json!(true)), "bool");
        assert_eq!(type_tag(&json!(3)), "int");
        assert_eq!(type_tag(&json!(3.5)), "float");
        assert_eq!(type_tag(&json!("s")), "string");
        assert_eq!(type_tag(&json!([1, 2])), "array");
        assert_eq!(type_tag(&json!({"k": 1})), "object");
    }

    #[test]
    fn test_int_widens_to_float() {
        assert!(tag_matches("float", &json!(2)));
        assert!(!tag_matches("int", &json!(2.5)));
    }

    #[test]
    fn test_any_matches_everything() {
        for v in [json!(null), json!(1), json!("x"), json!([]), json!({})] {
            assert!(tag_matches(ANY_TAG, &v));
        }
    }

    #[test]
    fn test_exact_match_required_otherwise() {
        assert!(tag_matches("string", &json!("x")));
        assert!(!tag_matches("string", &json!(1)));
        assert!(!tag_matches("object", &json!([])));
    }
}
