use tiller::config::Config;

#[test]
fn defaults_validate() {
    let config = Config::default();
    assert!(config.validate().is_ok());
}

#[test]
fn worker_pool_bounds_are_enforced() {
    let mut config = Config::default();
    config.engine.worker_pool = 0;
    assert!(config.validate().is_err());

    config.engine.worker_pool = 300;
    assert!(config.validate().is_err());
}

#[test]
fn slow_tick_cannot_undercut_fast_tick() {
    let mut config = Config::default();
    config.engine.fast_tick_secs = 30;
    config.engine.slow_tick_secs = 10;
    assert!(config.validate().is_err());
}

#[test]
fn fee_margin_and_epsilon_are_bounded() {
    let mut config = Config::default();
    config.engine.fee_margin = 0.5;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.engine.sell_epsilon = -0.01;
    assert!(config.validate().is_err());
}

#[test]
fn empty_endpoints_are_rejected() {
    let mut config = Config::default();
    config.binance.base_url = String::new();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.storage.postgres_dsn = "  ".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn file_values_override_defaults() {
    let path = std::env::temp_dir().join("tiller_config_test.toml");
    std::fs::write(
        &path,
        r#"
[engine]
fast_tick_secs = 5
worker_pool = 4

[bybit]
category = "spot"
account_type = "UNIFIED"

[storage]
postgres_dsn = "postgres://example/tiller"
"#,
    )
    .expect("write config");

    let config = Config::load(path.to_str().expect("path")).expect("load");
    assert_eq!(config.engine.fast_tick_secs, 5);
    assert_eq!(config.engine.worker_pool, 4);
    assert_eq!(config.engine.slow_tick_secs, 300);
    assert_eq!(config.storage.postgres_dsn, "postgres://example/tiller");

    std::fs::remove_file(&path).ok();
}
