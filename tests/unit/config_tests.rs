//! Configuration parsing and memory size strings.

use std::io::Write;

use arras_node::config::{memory_from_string, Config};

#[test]
fn memory_sizes_accept_k_m_g_suffixes() {
    assert_eq!(memory_from_string("").unwrap(), 0);
    assert_eq!(memory_from_string("1024").unwrap(), 1024);
    assert_eq!(memory_from_string("4k").unwrap(), 4 << 10);
    assert_eq!(memory_from_string("16M").unwrap(), 16 << 20);
    assert_eq!(memory_from_string("2g").unwrap(), 2 << 30);
    assert_eq!(memory_from_string("2G").unwrap(), 2 << 30);
}

#[test]
fn bad_memory_sizes_are_config_errors() {
    assert!(memory_from_string("lots").is_err());
    assert!(memory_from_string("-4g").is_err());
}

#[test]
fn defaults_are_sensible() {
    let config = Config::default();
    assert_eq!(config.node.http_port, 0, "OS picks the port by default");
    assert_eq!(config.node.ban_threshold, 5);
    assert_eq!(config.node.ban_window_secs, 300);
    assert_eq!(config.node.pre_delete_delay_ms, 50);
    assert_eq!(config.computation.client_connection_timeout_secs, 30);
    assert_eq!(config.computation.def_packaging_system, "rez1");
    assert!(config.computation.cleanup_process_group);
}

#[test]
fn toml_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[node]
http_port = 8090
ban_threshold = 9
exclusive_user = "renderfarm"

[computation]
log_level = 5
enforce_memory = true
"#
    )
    .unwrap();

    let config = Config::load(file.path()).expect("toml must parse");
    assert_eq!(config.node.http_port, 8090);
    assert_eq!(config.node.ban_threshold, 9);
    assert_eq!(config.node.exclusive_user, "renderfarm");
    assert_eq!(config.computation.log_level, 5);
    assert!(config.computation.enforce_memory);
    // untouched keys keep their defaults
    assert_eq!(config.node.ban_window_secs, 300);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let config = Config::load_or_default(std::path::Path::new("/nonexistent/arras.toml"))
        .expect("missing file is fine");
    assert_eq!(config, Config::default());
}
