// tests/settings_env.rs
//
// Environment parsing. Serialized because the tests mutate process env.

use std::time::Duration;

use serial_test::serial;

use announce_relay::config::Settings;
use announce_relay::error::ConfigError;

const KEYS: &[&str] = &[
    "POLL_WINDOW",
    "CONSECUTIVE_MISS_LIMIT",
    "ACTIVE_HOURS",
    "FETCH_TIMEOUT_SECS",
    "DIAG_ADDR",
];

fn clear() {
    for k in KEYS {
        std::env::remove_var(k);
    }
}

#[test]
#[serial]
fn defaults_apply_when_unset() {
    clear();
    let s = Settings::from_env().unwrap();
    assert_eq!(s.poll_window, 10);
    assert_eq!(s.default_miss_limit, 4);
    assert!(s.active_hours.is_none());
    assert!(s.diag_addr.is_none());
}

#[test]
#[serial]
fn values_are_read_and_validated() {
    clear();
    std::env::set_var("POLL_WINDOW", "30");
    std::env::set_var("ACTIVE_HOURS", "8-24");
    std::env::set_var("FETCH_TIMEOUT_SECS", "3");
    let s = Settings::from_env().unwrap();
    assert_eq!(s.poll_window, 30);
    assert_eq!(s.fetch_timeout, Duration::from_secs(3));
    let hours = s.active_hours.unwrap();
    assert!(hours.contains_hour(8));
    assert!(!hours.contains_hour(7));

    std::env::set_var("CONSECUTIVE_MISS_LIMIT", "0");
    assert!(matches!(
        Settings::from_env(),
        Err(ConfigError::InvalidValue { key, .. }) if key == "CONSECUTIVE_MISS_LIMIT"
    ));
    clear();
}

#[test]
#[serial]
fn malformed_number_is_rejected() {
    clear();
    std::env::set_var("POLL_WINDOW", "ten");
    assert!(Settings::from_env().is_err());
    clear();
}
