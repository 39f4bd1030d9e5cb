use chrono::{Duration, Utc};
use courier::outbox::{compute_backoff, encode_payload, truncate_error};
use serde_json::json;

#[test]
fn test_backoff_first_attempt() {
    assert_eq!(compute_backoff(1), Duration::milliseconds(500));
}

#[test]
fn test_backoff_second_attempt() {
    assert_eq!(compute_backoff(2), Duration::milliseconds(1000));
}

#[test]
fn test_backoff_third_attempt() {
    assert_eq!(compute_backoff(3), Duration::milliseconds(2000));
}

#[test]
fn test_backoff_sixth_attempt() {
    assert_eq!(compute_backoff(6), Duration::milliseconds(16_000));
}

#[test]
fn test_backoff_caps_at_thirty_seconds() {
    assert_eq!(compute_backoff(7), Duration::milliseconds(30_000));
    assert_eq!(compute_backoff(8), Duration::milliseconds(30_000));
    assert_eq!(compute_backoff(100), Duration::milliseconds(30_000));
}

#[test]
fn test_backoff_zero_and_negative_attempts() {
    assert_eq!(compute_backoff(0), Duration::milliseconds(500));
    assert_eq!(compute_backoff(-1), Duration::milliseconds(500));
}

#[test]
fn test_backoff_is_monotonic_until_cap() {
    let mut previous = Duration::zero();
    for attempts in 1..=10 {
        let delay = compute_backoff(attempts);
        assert!(delay >= previous);
        previous = delay;
    }
}

#[test]
fn test_truncate_error_limits_to_1000_chars() {
    let long = "x".repeat(5000);
    assert_eq!(truncate_error(&long).chars().count(), 1000);
}

#[test]
fn test_truncate_error_keeps_short_messages() {
    assert_eq!(truncate_error("connection refused"), "connection refused");
}

#[test]
fn test_encode_payload_sorted_keys_compact() {
    let encoded = encode_payload(1, Utc::now(), json!({"zeta": 1, "alpha": 2}));
    let occurred_pos = encoded.find("occurred_at").unwrap();
    let payload_pos = encoded.find("payload").unwrap();
    let seq_pos = encoded.find("\"seq\"").unwrap();
    assert!(occurred_pos < payload_pos && payload_pos < seq_pos);
    assert!(encoded.contains(r#"{"alpha":2,"zeta":1}"#));
    assert!(!encoded.contains(": "));
}

#[test]
fn test_encode_payload_decodes_back() {
    let occurred_at = Utc::now();
    let encoded = encode_payload(9, occurred_at, json!({"content": "hi"}));
    let decoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded["seq"], 9);
    assert_eq!(decoded["payload"]["content"], "hi");
    assert!(decoded["occurred_at"].is_string());
}
