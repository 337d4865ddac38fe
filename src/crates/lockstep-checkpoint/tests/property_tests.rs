//! Property tests for reducer identity laws and codec round-trips

use lockstep_checkpoint::codec::{Codec, JsonCodec};
use lockstep_checkpoint::reducer;
use proptest::prelude::*;
use serde_json::{json, Value};

fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z0-9 ]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(depth, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(|m| {
                Value::Object(m.into_iter().collect())
            }),
        ]
    })
}

proptest! {
    #[test]
    fn codec_round_trips_any_value(v in arb_json(3)) {
        let codec = JsonCodec::new();
        let bytes = codec.encode(&v).unwrap();
        prop_assert_eq!(codec.decode(&bytes).unwrap(), v);
    }

    #[test]
    fn codec_encoding_is_deterministic(v in arb_json(3)) {
        let codec = JsonCodec::new();
        prop_assert_eq!(codec.encode(&v).unwrap(), codec.encode(&v).unwrap());
    }

    #[test]
    fn last_write_wins_fixpoint(v in arb_json(2)) {
        let r = reducer::last_write_wins();
        prop_assert_eq!(r(&v, &v).unwrap(), v);
    }

    #[test]
    fn append_empty_update_is_identity(items in prop::collection::vec(arb_json(1), 0..8)) {
        let seq = Value::Array(items);
        let r = reducer::append();
        prop_assert_eq!(r(&seq, &json!([])).unwrap(), seq);
    }

    #[test]
    fn set_union_empty_update_is_identity(items in prop::collection::vec(any::<i64>().prop_map(Value::from), 0..8)) {
        let seq = Value::Array(items);
        let r = reducer::set_union();
        prop_assert_eq!(r(&seq, &json!([])).unwrap(), seq);
    }

    #[test]
    fn set_union_is_idempotent(items in prop::collection::vec(any::<i64>().prop_map(Value::from), 0..8)) {
        let seq = Value::Array(items);
        let r = reducer::set_union();
        let once = r(&json!([]), &seq).unwrap();
        let twice = r(&once, &seq).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn sum_zero_is_identity(n in any::<i32>()) {
        let r = reducer::sum();
        prop_assert_eq!(r(&json!(n), &json!(0)).unwrap(), json!(n));
    }

    #[test]
    fn dict_merge_empty_update_is_identity(m in prop::collection::btree_map("[a-z]{1,6}", any::<i64>().prop_map(Value::from), 0..6)) {
        let obj = Value::Object(m.into_iter().collect());
        let r = reducer::dict_merge(reducer::last_write_wins());
        prop_assert_eq!(r(&obj, &json!({})).unwrap(), obj);
    }
}
