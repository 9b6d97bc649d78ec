// tests/config_load.rs
use polyterm_pulse::config::{PulseConfig, ENV_PATH, ENV_REFRESH, ENV_WALLET};
use polyterm_pulse::sources::SourceKind;
use std::{env, fs};

fn clear_env() {
    env::remove_var(ENV_PATH);
    env::remove_var(ENV_WALLET);
    env::remove_var(ENV_REFRESH);
}

#[test]
fn toml_and_json_files_load() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("pulse.toml");
    fs::write(
        &p_toml,
        r#"
wallet_address = "0xabc"
rss_urls = ["https://feeds.example/world.xml"]

[[topics]]
key = "venezuela"
title = "Venezuela"
keywords = ["Venezuela", "Maduro"]

[rotation]
failure_threshold = 2
"#,
    )
    .unwrap();
    let cfg = PulseConfig::load_from(&p_toml).unwrap();
    assert_eq!(cfg.wallet_address.as_deref(), Some("0xabc"));
    assert_eq!(cfg.topics[0].keywords, ["Venezuela", "Maduro"]);
    assert_eq!(cfg.rotation.failure_threshold, 2);
    assert_eq!(cfg.registry().endpoint_count(SourceKind::DirectRss), 1);

    let p_json = dir.path().join("pulse.json");
    fs::write(
        &p_json,
        r#"{"refresh_seconds": 60, "custom_keyword_buckets": {"fed": ["FOMC", "Powell"]}}"#,
    )
    .unwrap();
    let cfg = PulseConfig::load_from(&p_json).unwrap();
    assert_eq!(cfg.refresh_seconds, 60);
    assert_eq!(cfg.coordinator_settings().custom_keyword_buckets["fed"], ["FOMC", "Powell"]);
    assert!(cfg.validate().is_ok());

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "refresh_seconds = \"soon\"").unwrap();
    let err = PulseConfig::load_from(&broken).unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
}

#[test]
fn malformed_topic_does_not_fail_validation() {
    let mut cfg = PulseConfig::default();
    cfg.topics.push(polyterm_pulse::KeywordBucket::new(
        "empty",
        "Empty",
        Vec::<String>::new(),
    ));
    assert!(cfg.validate().is_ok());
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    // 1) nothing on disk: defaults
    let cfg = PulseConfig::load_default().unwrap();
    assert_eq!(cfg, PulseConfig::default());

    // 2) ./config/pulse.json, then pulse.toml wins over it
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("pulse.json"), r#"{"refresh_seconds": 45}"#).unwrap();
    assert_eq!(PulseConfig::load_default().unwrap().refresh_seconds, 45);
    fs::write(cfg_dir.join("pulse.toml"), "refresh_seconds = 30").unwrap();
    assert_eq!(PulseConfig::load_default().unwrap().refresh_seconds, 30);

    // 3) the env path takes precedence
    let p_env = tmp.path().join("elsewhere.json");
    fs::write(&p_env, r#"{"refresh_seconds": 90}"#).unwrap();
    env::set_var(ENV_PATH, p_env.display().to_string());
    assert_eq!(PulseConfig::load_default().unwrap().refresh_seconds, 90);

    env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
    assert!(PulseConfig::load_default().is_err());

    clear_env();
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn env_overrides_are_applied_and_clamped() {
    clear_env();
    env::set_var(ENV_WALLET, " 0xfeed ");
    env::set_var(ENV_REFRESH, "1");
    let mut cfg = PulseConfig::default();
    cfg.apply_env_overrides().unwrap();
    assert_eq!(cfg.wallet_address.as_deref(), Some("0xfeed"));
    assert_eq!(cfg.refresh_seconds, 5);

    env::set_var(ENV_REFRESH, "fast");
    assert!(cfg.apply_env_overrides().is_err());

    // blank wallet clears the configured one
    env::set_var(ENV_WALLET, "");
    env::remove_var(ENV_REFRESH);
    cfg.apply_env_overrides().unwrap();
    assert_eq!(cfg.wallet_address, None);
    clear_env();
}
