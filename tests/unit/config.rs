use courier::config::{
    expand_tilde, resolve_database_url, AuthConfig, Config, DatabaseConfig, DispatcherConfig,
    MessagingConfig, ServerConfig, WsConfig,
};
use std::path::PathBuf;

#[test]
fn test_config_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 8094);
    assert_eq!(cfg.server.cors_origins.len(), 2);
    assert!(cfg.database.url.is_none());
    assert_eq!(cfg.auth.secret_key, "change-me-in-production");
    assert_eq!(cfg.messaging.message_max_length, 2000);
}

#[test]
fn test_auth_config_defaults() {
    let auth = AuthConfig::default();
    assert_eq!(auth.jwt_algorithm, "HS256");
    assert_eq!(auth.access_token_expire_minutes, 15);
    assert_eq!(auth.refresh_token_expire_days, 30);
    assert_eq!(auth.rate_limit_window_seconds, 60);
    assert_eq!(auth.rate_limit_max_requests, 12);
}

#[test]
fn test_ws_config_defaults() {
    let ws = WsConfig::default();
    assert_eq!(ws.heartbeat_sec, 25);
    assert_eq!(ws.idle_timeout_sec, 60);
    assert_eq!(ws.max_command_bytes, 8192);
    assert_eq!(ws.rate_limit_window_sec, 10);
    assert_eq!(ws.rate_limit_max_commands, 20);
    assert_eq!(ws.max_ids_per_subscribe, 50);
    assert_eq!(ws.max_subscriptions_per_connection, 200);
}

#[test]
fn test_dispatcher_config_defaults() {
    let dispatcher = DispatcherConfig::default();
    assert!(dispatcher.enabled);
    assert_eq!(dispatcher.poll_ms, 250);
    assert_eq!(dispatcher.batch_size, 100);
}

#[test]
fn test_messaging_config_defaults() {
    assert_eq!(MessagingConfig::default().message_max_length, 2000);
}

#[test]
fn test_expand_tilde_absolute_path_unchanged() {
    assert_eq!(
        expand_tilde("/var/lib/courier.db"),
        PathBuf::from("/var/lib/courier.db")
    );
}

#[test]
fn test_resolve_database_url_prefers_explicit_url() {
    let cfg = Config {
        database: DatabaseConfig {
            url: Some("postgres://db.internal/courier".to_string()),
            sqlite_path: "~/.courier/state.sqlite".to_string(),
        },
        ..Config::default()
    };
    assert_eq!(resolve_database_url(&cfg), "postgres://db.internal/courier");
}

#[test]
fn test_resolve_database_url_builds_sqlite_url() {
    let cfg = Config {
        database: DatabaseConfig {
            url: None,
            sqlite_path: "/tmp/courier-config-test/state.sqlite".to_string(),
        },
        ..Config::default()
    };
    let url = resolve_database_url(&cfg);
    assert!(url.starts_with("sqlite://"));
    assert!(url.ends_with("state.sqlite"));
}

#[test]
fn test_config_json_roundtrip() {
    let cfg = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9100,
            cors_origins: vec!["http://localhost:5173".to_string()],
        },
        ..Config::default()
    };
    let raw = serde_json::to_string(&cfg).unwrap();
    let parsed: Config = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.server.host, "127.0.0.1");
    assert_eq!(parsed.server.port, 9100);
    assert_eq!(parsed.server.cors_origins.len(), 1);
}

#[test]
fn test_partial_json_uses_defaults_for_missing_sections() {
    let parsed: Config =
        serde_json::from_str(r#"{"auth":{"secret_key":"s3cret"}}"#).unwrap();
    assert_eq!(parsed.auth.secret_key, "s3cret");
    assert_eq!(parsed.auth.jwt_algorithm, "HS256");
    assert_eq!(parsed.server.port, 8094);
    assert!(parsed.dispatcher.enabled);
}
