use mcpproxy::ProxyError;
use mcpproxy::config::{Config, ServerSpec, merge_config, merge_server_spec};
use serde_json::json;

fn base_spec() -> ServerSpec {
    let mut spec = ServerSpec::new("srv1");
    spec.url = Some("http://a".into());
    spec.env.insert("A".into(), "1".into());
    spec.env.insert("B".into(), "2".into());
    spec
}

#[test]
fn immutable_name_rejected_and_base_unchanged() {
    let base = base_spec();
    let err = merge_server_spec(&base, &json!({"name": "srv2"})).unwrap_err();
    match err {
        ProxyError::ImmutableField { field } => assert_eq!(field, "name"),
        other => panic!("expected ImmutableField, got {other:?}"),
    }
    assert_eq!(base.name, "srv1");
    assert_eq!(base.url.as_deref(), Some("http://a"));
}

#[test]
fn env_deep_merge_matches_contract() {
    // base {A:1, B:2} + patch {B:9, C:3} == {A:1, B:9, C:3}
    let (merged, _) = merge_server_spec(&base_spec(), &json!({"env": {"B": "9", "C": "3"}})).unwrap();
    assert_eq!(merged.env.len(), 3);
    assert_eq!(merged.env["A"], "1");
    assert_eq!(merged.env["B"], "9");
    assert_eq!(merged.env["C"], "3");
}

#[test]
fn diff_reports_before_and_after() {
    let (_, diff) = merge_server_spec(&base_spec(), &json!({"url": "http://b"})).unwrap();
    assert_eq!(diff.modified.len(), 1);
    assert_eq!(diff.modified[0].field, "url");
    assert_eq!(diff.modified[0].before, json!("http://a"));
    assert_eq!(diff.modified[0].after, json!("http://b"));
}

#[test]
fn merging_patch_twice_is_idempotent() {
    let patch = json!({"env": {"B": "9", "C": "3"}, "url": "http://b"});
    let (once, _) = merge_server_spec(&base_spec(), &patch).unwrap();
    let (twice, diff) = merge_server_spec(&once, &patch).unwrap();
    assert_eq!(once.env, twice.env);
    assert_eq!(once.url, twice.url);
    assert!(diff.modified.is_empty() && diff.added.is_empty() && diff.removed.is_empty());
}

#[test]
fn config_survives_serde_round_trip() {
    let mut config = Config::default();
    config.api_key = Some("k".into());
    config.top_k = 9;
    config.tls.enabled = true;
    config.tls.certs_dir = Some("/tmp/certs".into());
    let mut spec = base_spec();
    spec.args = vec!["--flag".into()];
    config.mcp_servers.push(spec);

    let json = serde_json::to_string(&config).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(config, back);
}

#[test]
fn merge_config_patches_scalars() {
    let base = Config::default();
    let (merged, _) = merge_config(&base, &json!({"tool_response_limit": 512})).unwrap();
    assert_eq!(merged.tool_response_limit, 512);
    // untouched fields keep their values
    assert_eq!(merged.top_k, base.top_k);
}

mod laws {
    use super::*;
    use proptest::prelude::*;

    fn env_map() -> impl Strategy<Value = std::collections::HashMap<String, String>> {
        proptest::collection::hash_map("[A-Z]{1,6}", "[a-z0-9]{0,8}", 0..6)
    }

    proptest! {
        /// Non-conflicting field-level union: every patch key wins, every
        /// untouched base key survives.
        #[test]
        fn env_merge_is_field_level_union(base_env in env_map(), patch_env in env_map()) {
            let mut base = ServerSpec::new("s");
            base.command = Some("echo".into());
            base.env = base_env.clone();
            let patch = serde_json::json!({"env": patch_env});
            let (merged, _) = merge_server_spec(&base, &patch).unwrap();

            for (key, value) in &patch_env {
                prop_assert_eq!(merged.env.get(key), Some(value));
            }
            for (key, value) in &base_env {
                if !patch_env.contains_key(key) {
                    prop_assert_eq!(merged.env.get(key), Some(value));
                }
            }
        }

        /// Replaying the base's own fields over a merged result restores
        /// base values for those fields.
        #[test]
        fn base_fields_reapply_cleanly(url in "https?://[a-z]{3,10}") {
            let mut base = ServerSpec::new("s");
            base.url = Some(url.clone());
            let (merged, _) = merge_server_spec(&base, &serde_json::json!({"url": "http://other"})).unwrap();
            let (restored, _) = merge_server_spec(&merged, &serde_json::json!({"url": url.clone()})).unwrap();
            prop_assert_eq!(restored.url.as_deref(), Some(url.as_str()));
        }

        /// Immutable fields always fail, for any new name.
        #[test]
        fn immutable_always_fails(name in "[a-z]{1,12}") {
            prop_assume!(name != "s");
            let mut base = ServerSpec::new("s");
            base.command = Some("echo".into());
            let result = merge_server_spec(&base, &serde_json::json!({"name": name}));
            let is_immutable_field_err = matches!(result, Err(ProxyError::ImmutableField { .. }));
            prop_assert!(is_immutable_field_err);
        }
    }
}
