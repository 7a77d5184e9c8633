// tests/cursor_writeback.rs
//
// Cursor write-back into the routing table file.

use std::sync::Arc;

use announce_relay::config::{load_routing_table, ConfigStore, Settings};
use announce_relay::error::ConfigError;

const TABLE: &str = r#"
[[rules]]
name = "exchange"
source = { kind = "id-sequence-feed", base_url_template = "https://f.example/a/{id}", start_id = 20 }
filters = [{ kind = "match-all" }]
destinations = [{ kind = "chat-channel", target_id = 1 }]

[[rules]]
name = "other"
source = { kind = "id-sequence-feed", base_url_template = "https://g.example/{id}", start_id = 7 }
filters = [{ kind = "keyword-any", keywords = ["listing"] }]
destinations = [{ kind = "chat-group", target_id = 2 }]
"#;

fn start_ids(path: &std::path::Path) -> Vec<(String, u64)> {
    let table = load_routing_table(path, &Settings::default()).expect("reloads");
    table
        .id_sequence_rules()
        .map(|(r, s)| (r.name.clone(), s.start_id))
        .collect()
}

#[test]
fn persists_only_the_named_rule() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, TABLE).unwrap();

    let store = ConfigStore::new(path.clone());
    store.persist_start_id("exchange", 24).unwrap();

    assert_eq!(
        start_ids(&path),
        vec![("exchange".to_string(), 24), ("other".to_string(), 7)]
    );
}

#[test]
fn write_back_never_lowers_the_stored_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, TABLE).unwrap();

    let store = ConfigStore::new(path.clone());
    store.persist_start_id("exchange", 30).unwrap();
    store.persist_start_id("exchange", 25).unwrap();
    assert_eq!(start_ids(&path)[0].1, 30);
}

#[test]
fn unknown_rule_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, TABLE).unwrap();

    let err = ConfigStore::new(path)
        .persist_start_id("missing", 3)
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownRule(r) if r == "missing"));
}

#[tokio::test]
async fn concurrent_writers_both_land() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, TABLE).unwrap();

    let store = Arc::new(ConfigStore::new(path.clone()));
    let (a, b) = tokio::join!(
        store.persist_start_id_async("exchange", 40),
        store.persist_start_id_async("other", 9),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(
        start_ids(&path),
        vec![("exchange".to_string(), 40), ("other".to_string(), 9)]
    );
}

#[test]
fn shipped_sample_config_loads() {
    let table = load_routing_table(
        std::path::Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/relay.toml")),
        &Settings::default(),
    )
    .expect("sample config is valid");
    assert_eq!(table.rules.len(), 3);
}
