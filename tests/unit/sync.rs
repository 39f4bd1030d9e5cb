use courier::sync::parse_after_seq_by_conversation;

#[test]
fn test_none_and_empty_default_to_empty_map() {
    assert!(parse_after_seq_by_conversation(None).unwrap().is_empty());
    assert!(parse_after_seq_by_conversation(Some("")).unwrap().is_empty());
}

#[test]
fn test_json_object_form() {
    let parsed =
        parse_after_seq_by_conversation(Some(r#"{"conv-a":12,"conv-b":0}"#)).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed["conv-a"], 12);
    assert_eq!(parsed["conv-b"], 0);
}

#[test]
fn test_compact_form() {
    let parsed = parse_after_seq_by_conversation(Some("conv-a:12,conv-b:7")).unwrap();
    assert_eq!(parsed["conv-a"], 12);
    assert_eq!(parsed["conv-b"], 7);
}

#[test]
fn test_compact_form_tolerates_whitespace_and_blanks() {
    let parsed = parse_after_seq_by_conversation(Some(" conv-a : 3 ,, conv-b:4 ,")).unwrap();
    assert_eq!(parsed["conv-a"], 3);
    assert_eq!(parsed["conv-b"], 4);
}

#[test]
fn test_json_non_object_rejected() {
    for raw in ["[1,2,3]", "42", r#""conv-a""#, "true"] {
        let err = parse_after_seq_by_conversation(Some(raw)).unwrap_err();
        assert_eq!(err.code, "invalid_after_seq");
    }
}

#[test]
fn test_json_negative_or_non_integer_seq_rejected() {
    assert!(parse_after_seq_by_conversation(Some(r#"{"conv-a":-1}"#)).is_err());
    assert!(parse_after_seq_by_conversation(Some(r#"{"conv-a":"12"}"#)).is_err());
    assert!(parse_after_seq_by_conversation(Some(r#"{"conv-a":1.5}"#)).is_err());
}

#[test]
fn test_compact_malformed_pairs_rejected() {
    assert!(parse_after_seq_by_conversation(Some("conv-a")).is_err());
    assert!(parse_after_seq_by_conversation(Some("conv-a:")).is_err());
    assert!(parse_after_seq_by_conversation(Some(":5")).is_err());
    assert!(parse_after_seq_by_conversation(Some("conv-a:five")).is_err());
    assert!(parse_after_seq_by_conversation(Some("conv-a:-2")).is_err());
}

#[test]
fn test_compact_last_entry_wins_on_duplicates() {
    let parsed = parse_after_seq_by_conversation(Some("conv-a:1,conv-a:9")).unwrap();
    assert_eq!(parsed["conv-a"], 9);
}
