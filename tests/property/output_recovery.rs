//! Structured output recovery from free-form text

use promptline::recovery::{normalize_output, recover_json};
use proptest::prelude::*;
use serde_json::{json, Value};

fn numbers() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(any::<i64>(), 0..8)
}

/// A fenced list survives arbitrary prose around it
#[test]
fn test_fenced_lists_are_recovered() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(numbers(), "[a-zA-Z ,.:]{0,40}"), |(values, prose)| {
            let payload = json!(values);
            let text = format!("{}\n```json\n{}\n```\n{}", prose, payload, prose);
            assert_eq!(recover_json(&text).unwrap(), payload);
            Ok(())
        })
        .unwrap();
}

/// A bare object after a lead-in is recovered by prefix parsing
#[test]
fn test_trailing_text_after_json_is_ignored() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(any::<i64>(), "[a-z ]{0,20}"), |(n, tail)| {
            let text = format!("Result: {{\"n\": {}}} {}", n, tail);
            assert_eq!(recover_json(&text).unwrap(), json!({ "n": n }));
            Ok(())
        })
        .unwrap();
}

/// Text without any JSON never recovers
#[test]
fn test_plain_prose_fails() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&"[A-Z ,.]{0,60}", |text| {
            assert!(recover_json(&text).is_err());
            Ok(())
        })
        .unwrap();
}

/// Normalized lists keep their order and every item gets an id and selection flag
#[test]
fn test_normalized_items_are_complete() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&numbers(), |values| {
            let normalized = normalize_output(json!(values));
            let items = normalized["items"].as_array().unwrap();
            assert_eq!(items.len(), values.len());
            for (item, value) in items.iter().zip(&values) {
                assert_eq!(item["value"], json!(value));
                assert_eq!(item["selected"], Value::Bool(true));
                assert!(item["id"].as_str().unwrap().starts_with("item_"));
            }
            Ok(())
        })
        .unwrap();
}
