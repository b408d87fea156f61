use std::path::Path;

use edgeflow_config::{parse_device_config, ConfigError, ConfigMode};

fn path() -> &'static Path {
    Path::new("device.yml")
}

#[test]
fn configured_device_parses() {
    let yaml = r#"
deviceId: dev-1
token: ffd_tok
credentialSecret: abc123
forgeURL: https://forge.example.com
"#;
    let cfg = parse_device_config(yaml, path()).expect("should parse");
    assert!(!cfg.provisioning_mode());
    assert_eq!(cfg.device_id(), Some("dev-1"));
    assert_eq!(cfg.token, "ffd_tok");
    assert_eq!(cfg.forge_url, "https://forge.example.com");
    assert!(cfg.broker.is_none());
}

#[test]
fn broker_overlay_requires_credentials() {
    let yaml = r#"
deviceId: dev-1
token: ffd_tok
credentialSecret: abc123
forgeURL: https://forge.example.com
brokerURL: mqtts://broker.example.com:8883
"#;
    let err = parse_device_config(yaml, path()).unwrap_err();
    match err {
        ConfigError::Invalid { missing, .. } => {
            assert!(missing.contains(&"brokerUsername".to_string()));
            assert!(missing.contains(&"brokerPassword".to_string()));
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[test]
fn broker_overlay_parses_when_complete() {
    let yaml = r#"
deviceId: dev-1
token: ffd_tok
credentialSecret: abc123
forgeURL: https://forge.example.com
brokerURL: wss://broker.example.com
brokerUsername: device:team:dev-1
brokerPassword: pw
"#;
    let cfg = parse_device_config(yaml, path()).expect("should parse");
    let broker = cfg.broker.expect("broker config");
    assert_eq!(broker.url, "wss://broker.example.com");
    assert_eq!(broker.username, "device:team:dev-1");
}

#[test]
fn provisioning_mode_detected_and_extras_preserved() {
    let yaml = r#"
provisioningToken: ffp_tok
provisioningTeam: team-1
forgeURL: https://forge.example.com
httpStatic: /data/static
somethingCustom: 42
"#;
    let cfg = parse_device_config(yaml, path()).expect("should parse");
    assert!(cfg.provisioning_mode());
    assert_eq!(cfg.token, "ffp_tok");
    match cfg.mode {
        ConfigMode::Provisioning { team, extras } => {
            assert_eq!(team, "team-1");
            assert!(extras.contains_key("httpStatic"));
            assert!(extras.contains_key("somethingCustom"));
        }
        _ => panic!("expected provisioning mode"),
    }
}

#[test]
fn missing_keys_are_all_listed() {
    let yaml = "deviceId: dev-1\n";
    let err = parse_device_config(yaml, path()).unwrap_err();
    match err {
        ConfigError::Invalid { missing, .. } => {
            assert!(missing.contains(&"forgeURL".to_string()));
            assert!(missing.contains(&"token".to_string()));
            assert!(missing.contains(&"credentialSecret".to_string()));
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[test]
fn http_node_auth_requires_user_and_pass() {
    let yaml = r#"
deviceId: dev-1
token: ffd_tok
credentialSecret: abc123
forgeURL: https://forge.example.com
httpNodeAuth:
  user: admin
"#;
    let err = parse_device_config(yaml, path()).unwrap_err();
    match err {
        ConfigError::Invalid { missing, .. } => {
            assert_eq!(missing, vec!["httpNodeAuth.pass".to_string()]);
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[test]
fn empty_file_is_a_distinct_error() {
    let err = parse_device_config("   \n", path()).unwrap_err();
    assert!(matches!(err, ConfigError::Empty { .. }));
}

#[test]
fn missing_file_returns_io_error() {
    let err =
        edgeflow_config::load_device_config(Path::new("/nonexistent/device.yml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
