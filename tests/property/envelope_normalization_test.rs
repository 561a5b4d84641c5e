//! Property-based tests for response envelope normalization.
//!
//! Whatever a handler returns, the caller always receives one well-formed
//! envelope: a boolean `success`, a timestamp, the protocol version and the
//! echoed message id, with `error` and `code` present exactly on failure.

use proptest::prelude::*;
use quicktabs::message_router::{normalize_response, DEFAULT_FAILURE_MESSAGE};
use quicktabs::types::message::{ErrorCode, InboundMessage, PROTOCOL_VERSION};
use serde_json::{json, Value};

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

fn arb_value() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_code_name() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop_oneof![
        Just("QUICK_TAB_NOT_FOUND".to_string()),
        Just("STORAGE_WRITE_FAILED".to_string()),
        "[A-Z_]{3,10}",
    ])
}

fn arb_message_id() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[a-z0-9-]{1,16}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn arbitrary_values_become_envelopes(value in arb_value(), message_id in arb_message_id()) {
        let envelope = normalize_response(value.clone(), message_id.clone());
        let wire = envelope.to_value();

        prop_assert!(wire["success"].is_boolean());
        prop_assert!(wire["timestamp"].as_i64().unwrap_or(0) > 0);
        prop_assert_eq!(wire["version"].as_str(), Some(PROTOCOL_VERSION));
        prop_assert_eq!(envelope.message_id.clone(), message_id);
        prop_assert_eq!(envelope.success, envelope.error.is_none());
        prop_assert_eq!(envelope.success, envelope.code.is_none());

        // Values without a boolean `success` are carried as data untouched.
        if !value.get("success").map(Value::is_boolean).unwrap_or(false) {
            prop_assert!(envelope.success);
            prop_assert_eq!(envelope.data, Some(value));
        }
    }

    #[test]
    fn shaped_failures_keep_known_codes(
        error in prop::option::of("[a-z ]{0,20}"),
        code in arb_code_name(),
    ) {
        let mut raw = json!({"success": false});
        if let Some(e) = &error {
            raw["error"] = json!(e);
        }
        if let Some(c) = &code {
            raw["code"] = json!(c);
        }
        let envelope = normalize_response(raw, None);

        prop_assert!(!envelope.success);
        let expected_error = error.filter(|e| !e.is_empty()).unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string());
        prop_assert_eq!(envelope.error, Some(expected_error));
        let expected_code = code.and_then(|c| ErrorCode::from_name(&c)).unwrap_or(ErrorCode::HandlerError);
        prop_assert_eq!(envelope.code, Some(expected_code));
    }

    #[test]
    fn shaped_success_unwraps_data(data in arb_value()) {
        let envelope = normalize_response(json!({"success": true, "data": data.clone()}), None);
        prop_assert!(envelope.success);
        prop_assert_eq!(envelope.data, Some(data));
    }

    #[test]
    fn message_id_survives_parsing(id in "[a-z0-9]{1,12}", numeric in any::<u32>()) {
        let parsed = InboundMessage::parse(&json!({"operation": "getState", "messageId": id.clone()})).unwrap();
        prop_assert_eq!(parsed.message_id, Some(id));
        let parsed = InboundMessage::parse(&json!({"operation": "getState", "messageId": numeric})).unwrap();
        prop_assert_eq!(parsed.message_id, Some(numeric.to_string()));
    }
}
