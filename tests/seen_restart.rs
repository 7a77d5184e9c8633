// tests/seen_restart.rs

use announce_relay::seen::SeenSet;

#[test]
fn recorded_link_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("sent_links.txt");

    {
        let mut seen = SeenSet::load(&path).unwrap();
        assert!(seen.is_empty());
        seen.record("gate", "https://l.example/a/1").unwrap();
        seen.record("gate", "https://l.example/a/1").unwrap();
    }

    let reloaded = SeenSet::load(&path).unwrap();
    assert!(reloaded.has("gate", "https://l.example/a/1"));
    assert!(!reloaded.has("gate", "https://l.example/a/2"));
    assert!(!reloaded.has("other", "https://l.example/a/1"));
    assert_eq!(reloaded.len(), 1);
}
