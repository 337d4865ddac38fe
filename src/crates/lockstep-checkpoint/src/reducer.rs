//! Reducers - deterministic merge functions for channel updates
//!
//! A reducer folds the writes a channel receives within one superstep into a
//! single committed value: `(current, update) -> value`. Reducers must be
//! deterministic and pure; the engine applies them in a fixed order (ascending
//! task ordinal, preserving each task's write emission order), so "associative
//! enough for ordered folding" is all that is required.
//!
//! # Standard factories
//!
//! | Factory | Semantics |
//! |---------|-----------|
//! | [`last_write_wins`] | update replaces current |
//! | [`append`] | current array extended with update (array flattened, scalar pushed) |
//! | [`optional_append`] | like `append`, but a `null` update is a no-op |
//! | [`set_union`] | current array plus update elements not already present |
//! | [`sum`] / [`min`] / [`max`] | numeric folds, integer-preserving |
//! | [`dict_merge`] | object merge, update keys in ascending UTF-8 order, conflicts through a nested reducer |
//! | [`message_append`] | `append` with message-shape validation |
//!
//! # Example
//!
//! ```rust
//! use lockstep_checkpoint::reducer;
//! use serde_json::json;
//!
//! let sum = reducer::sum();
//! let v = sum(&json!(3), &json!(4)).unwrap();
//! assert_eq!(v, json!(7));
//! ```

use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::sync::Arc;

/// Pure merge function applied per channel per superstep
pub type ReducerFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// Reducer that keeps only the most recent write
pub fn last_write_wins() -> ReducerFn {
    Arc::new(|_current, update| Ok(update.clone()))
}

/// Reducer that appends updates to an ordered sequence
///
/// The current value must be an array (a scalar current is promoted to a
/// one-element array). An array update extends the sequence; a scalar update
/// is pushed as a single element.
pub fn append() -> ReducerFn {
    Arc::new(|current, update| {
        let mut items = match current {
            Value::Array(a) => a.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        match update {
            Value::Array(a) => items.extend(a.iter().cloned()),
            other => items.push(other.clone()),
        }
        Ok(Value::Array(items))
    })
}

/// Like [`append`], but a `null` update leaves the sequence unchanged
pub fn optional_append() -> ReducerFn {
    let inner = append();
    Arc::new(move |current, update| {
        if update.is_null() {
            return Ok(current.clone());
        }
        inner(current, update)
    })
}

/// Reducer that unions update elements into the current sequence
///
/// Elements already present (by structural equality) are skipped; first-seen
/// order is preserved, which keeps the fold deterministic.
pub fn set_union() -> ReducerFn {
    Arc::new(|current, update| {
        let mut items = match current {
            Value::Array(a) => a.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        let incoming: Vec<Value> = match update {
            Value::Array(a) => a.clone(),
            other => vec![other.clone()],
        };
        for v in incoming {
            if !items.contains(&v) {
                items.push(v);
            }
        }
        Ok(Value::Array(items))
    })
}

fn numeric_fold(name: &'static str, f: fn(f64, f64) -> f64, fi: fn(i64, i64) -> i64) -> ReducerFn {
    Arc::new(move |current, update| {
        match (current, update) {
            (Value::Number(a), Value::Number(b)) => {
                if let (Some(ai), Some(bi)) = (a.as_i64(), b.as_i64()) {
                    Ok(Value::from(fi(ai, bi)))
                } else {
                    let af = a.as_f64().ok_or_else(|| {
                        CheckpointError::Reducer(format!("{name}: non-finite current"))
                    })?;
                    let bf = b.as_f64().ok_or_else(|| {
                        CheckpointError::Reducer(format!("{name}: non-finite update"))
                    })?;
                    serde_json::Number::from_f64(f(af, bf))
                        .map(Value::Number)
                        .ok_or_else(|| CheckpointError::Reducer(format!("{name}: non-finite result")))
                }
            }
            _ => Err(CheckpointError::Reducer(format!(
                "{name}: expected numbers, got {} and {}",
                crate::value::type_tag(current),
                crate::value::type_tag(update)
            ))),
        }
    })
}

/// Numeric sum reducer (integer-preserving)
pub fn sum() -> ReducerFn {
    numeric_fold("sum", |a, b| a + b, |a, b| a + b)
}

/// Numeric minimum reducer
pub fn min() -> ReducerFn {
    numeric_fold("min", f64::min, std::cmp::min)
}

/// Numeric maximum reducer
pub fn max() -> ReducerFn {
    numeric_fold("max", f64::max, std::cmp::max)
}

/// Object merge reducer with a nested reducer for key conflicts
///
/// Update keys are processed in ascending UTF-8 order. A key absent from the
/// current object is inserted; a key present in both is resolved by applying
/// `nested` to `(current[key], update[key])`.
pub fn dict_merge(nested: ReducerFn) -> ReducerFn {
    Arc::new(move |current, update| {
        let mut merged = match current {
            Value::Object(m) => m.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(CheckpointError::Reducer(format!(
                    "dict_merge: current is {}, expected object",
                    crate::value::type_tag(other)
                )))
            }
        };
        let incoming = match update {
            Value::Object(m) => m,
            other => {
                return Err(CheckpointError::Reducer(format!(
                    "dict_merge: update is {}, expected object",
                    crate::value::type_tag(other)
                )))
            }
        };
        let mut keys: Vec<&String> = incoming.keys().collect();
        keys.sort_unstable();
        for key in keys {
            let value = &incoming[key];
            match merged.get(key) {
                Some(existing) => {
                    let resolved = nested(existing, value)?;
                    merged.insert(key.clone(), resolved);
                }
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(merged))
    })
}

fn valid_message(value: &Value) -> bool {
    value
        .as_object()
        .map(|m| {
            m.get("role").map(|r| r.is_string()).unwrap_or(false)
                && m.get("content").is_some()
        })
        .unwrap_or(false)
}

/// Append reducer for message sequences
///
/// Each update element must be a message-shaped object (`role` string plus a
/// `content` field); anything else is rejected so malformed transcript writes
/// fail the step instead of corrupting the conversation channel.
pub fn message_append() -> ReducerFn {
    let inner = append();
    Arc::new(move |current, update| {
        let check = |v: &Value| -> Result<()> {
            if valid_message(v) {
                Ok(())
            } else {
                Err(CheckpointError::InvalidMessagesUpdate(format!(
                    "expected message object with string 'role' and 'content', got {}",
                    crate::value::type_tag(v)
                )))
            }
        };
        match update {
            Value::Array(items) => {
                for item in items {
                    check(item)?;
                }
            }
            other => check(other)?,
        }
        inner(current, update)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_write_wins() {
        let r = last_write_wins();
        assert_eq!(r(&json!(1), &json!(2)).unwrap(), json!(2));
        // identity law: folding the current value back is a fixpoint
        assert_eq!(r(&json!(7), &json!(7)).unwrap(), json!(7));
    }

    #[test]
    fn test_append_flattens_arrays() {
        let r = append();
        assert_eq!(r(&json!([1]), &json!([2, 3])).unwrap(), json!([1, 2, 3]));
        assert_eq!(r(&json!([1]), &json!(2)).unwrap(), json!([1, 2]));
        // identity law: empty update
        assert_eq!(r(&json!([1, 2]), &json!([])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_optional_append_skips_null() {
        let r = optional_append();
        assert_eq!(r(&json!([1]), &json!(null)).unwrap(), json!([1]));
        assert_eq!(r(&json!([1]), &json!(2)).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_set_union() {
        let r = set_union();
        assert_eq!(r(&json!([1, 2]), &json!([2, 3])).unwrap(), json!([1, 2, 3]));
        // identity law: empty update
        assert_eq!(r(&json!([1, 2]), &json!([])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_sum_preserves_integers() {
        let r = sum();
        let v = r(&json!(2), &json!(3)).unwrap();
        assert_eq!(v, json!(5));
        assert!(v.is_i64());
        assert_eq!(r(&json!(1.5), &json!(2)).unwrap(), json!(3.5));
        // identity law
        assert_eq!(r(&json!(9), &json!(0)).unwrap(), json!(9));
    }

    #[test]
    fn test_min_max() {
        assert_eq!(min()(&json!(4), &json!(2)).unwrap(), json!(2));
        assert_eq!(max()(&json!(4), &json!(2)).unwrap(), json!(4));
    }

    #[test]
    fn test_sum_rejects_non_numbers() {
        let r = sum();
        assert!(r(&json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn test_dict_merge_ascending_key_order() {
        // nested append makes key processing order observable
        let r = dict_merge(append());
        let current = json!({"k": [0]});
        let update = json!({"z": 1, "a": 2, "k": [9]});
        let merged = r(&current, &update).unwrap();
        assert_eq!(merged, json!({"a": 2, "k": [0, 9], "z": 1}));
        // identity law: empty update object
        assert_eq!(r(&current, &json!({})).unwrap(), current);
    }

    #[test]
    fn test_dict_merge_rejects_non_object_update() {
        let r = dict_merge(last_write_wins());
        assert!(r(&json!({}), &json!(1)).is_err());
    }

    #[test]
    fn test_message_append_accepts_messages() {
        let r = message_append();
        let out = r(
            &json!([]),
            &json!([{"role": "user", "content": "hi"}]),
        )
        .unwrap();
        assert_eq!(out, json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn test_message_append_rejects_malformed() {
        let r = message_append();
        let err = r(&json!([]), &json!([{"content": "no role"}])).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidMessagesUpdate(_)));
    }
}
