use kbd_config::Config;

#[test]
fn default_config_parses() {
    let config = Config::default();
    assert_eq!(config.hold_ttl_ms, 10_000);
    assert_eq!(config.initial_window_ms, 80);
    assert_eq!(config.guest_max_in_flight, 2);
    assert_eq!(config.controller_path, "vmctl");
    assert!(config.socket_path.is_none());
}

#[test]
fn overrides_apply() {
    let text = r#"
        hold-ttl-ms 5000
        initial-window-ms 120
        controller-path "my-vmctl"
        socket-path "/tmp/kbd.sock"
    "#;
    let config = Config::parse("test.kdl", text).unwrap();
    assert_eq!(config.hold_ttl_ms, 5000);
    assert_eq!(config.initial_window_ms, 120);
    assert_eq!(config.janitor_cap, 50, "unset fields keep their default");
    assert_eq!(config.controller_path, "my-vmctl");
    assert_eq!(config.socket_path(), Some("/tmp/kbd.sock".into()));
}

#[test]
fn rejects_garbage() {
    let err = Config::parse("bad.kdl", "hold-ttl-ms \"not a number\"");
    assert!(err.is_err());
}
