//! Registration tag validation rules.

use arras_node::node::validate_tags;

#[test]
fn empty_tag_set_is_valid() {
    assert!(validate_tags(&serde_json::json!({})).is_ok());
}

#[test]
fn exclusive_user_alone_is_valid() {
    assert!(validate_tags(&serde_json::json!({ "exclusive_user": "joe" })).is_ok());
}

#[test]
fn exclusive_team_requires_exclusive_production() {
    let err = validate_tags(&serde_json::json!({ "exclusive_team": "lighting" }))
        .expect_err("team without production must fail");
    assert!(err.to_string().contains("exclusive_production"));

    assert!(validate_tags(&serde_json::json!({
        "exclusive_production": "bigmovie",
        "exclusive_team": "lighting",
    }))
    .is_ok());
}

#[test]
fn over_subscribe_must_be_boolean() {
    let err = validate_tags(&serde_json::json!({
        "exclusive_user": "joe",
        "over_subscribe": "yes",
    }))
    .expect_err("string over_subscribe must fail");
    assert!(err.to_string().contains("type bool"));
}

#[test]
fn over_subscribe_requires_exclusive_user() {
    let err = validate_tags(&serde_json::json!({ "over_subscribe": true }))
        .expect_err("over_subscribe without exclusive_user must fail");
    assert!(err.to_string().contains("exclusive_user"));

    assert!(validate_tags(&serde_json::json!({
        "exclusive_user": "joe",
        "over_subscribe": true,
    }))
    .is_ok());

    // a false value doesn't demand anything
    assert!(validate_tags(&serde_json::json!({ "over_subscribe": false })).is_ok());
}

#[test]
fn multiple_violations_are_all_reported() {
    let err = validate_tags(&serde_json::json!({
        "exclusive_team": "lighting",
        "over_subscribe": true,
    }))
    .expect_err("two violations must fail");
    let message = err.to_string();
    assert!(message.contains("exclusive_production"));
    assert!(message.contains("exclusive_user"));
}
