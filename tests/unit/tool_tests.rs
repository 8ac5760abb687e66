use fog::tool::{by_name, first_available, is_on_path, looks_like_unknown_flag_error, registry};

#[test]
fn registry_contains_every_known_adapter_by_name() {
    let names: Vec<&'static str> = registry().iter().map(|a| a.name()).collect();
    assert!(names.contains(&"claude"));
    assert!(names.contains(&"cursor"));
    assert!(names.contains(&"gemini"));
    assert!(names.contains(&"aider"));
    assert_eq!(names.len(), 4);
}

#[test]
fn by_name_resolves_known_and_rejects_unknown() {
    assert!(by_name("claude").is_some());
    assert!(by_name("aider").is_some());
    assert!(by_name("not-a-real-tool").is_none());
}

#[test]
fn is_on_path_finds_a_real_binary_and_rejects_a_fake_one() {
    assert!(is_on_path("sh"));
    assert!(!is_on_path("definitely-not-a-real-binary-xyz"));
}

#[test]
fn first_available_prefers_earlier_candidates_in_order() {
    let found = first_available(&["definitely-not-a-real-binary-xyz", "sh"]);
    assert_eq!(found, Some("sh"));

    let none = first_available(&["definitely-not-a-real-binary-xyz", "also-not-real"]);
    assert_eq!(none, None);
}

#[test]
fn looks_like_unknown_flag_error_matches_known_phrasings() {
    assert!(looks_like_unknown_flag_error(""));
    assert!(looks_like_unknown_flag_error("   "));
    assert!(looks_like_unknown_flag_error("Error: unknown flag '--foo'"));
    assert!(looks_like_unknown_flag_error("unrecognized arguments: --bar"));
    assert!(looks_like_unknown_flag_error("UNKNOWN OPTION --baz"));
}

#[test]
fn looks_like_unknown_flag_error_does_not_match_genuine_failures() {
    assert!(!looks_like_unknown_flag_error("error: tests failed in widget.rs"));
    assert!(!looks_like_unknown_flag_error("permission denied"));
}
