//! Integration tests for driver configuration
//!
//! Tests TOML parsing, defaults for omitted keys, save/load round trips and
//! rejection of invalid values.

use tempfile::TempDir;
use usbmouse::config::{DriverConfig, OutputFormat};

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"
output = "json"
event_queue_depth = 32

[usb]
filters = ["0x046d:*", "0x1bcf:0x0005"]
auto_open = false
detach_kernel_driver = false
set_boot_protocol = true
poll_timeout_ms = 250
"#;

#[test]
fn test_parse_full_config() {
    let config: DriverConfig = toml::from_str(FULL_CONFIG).unwrap();

    assert_eq!(config.driver.log_level, "debug");
    assert_eq!(config.driver.output, OutputFormat::Json);
    assert_eq!(config.driver.event_queue_depth, 32);
    assert_eq!(config.usb.filters, vec!["0x046d:*", "0x1bcf:0x0005"]);
    assert!(!config.usb.auto_open);
    assert!(!config.usb.detach_kernel_driver);
    assert_eq!(config.usb.poll_timeout_ms, 250);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_sections_use_defaults() {
    let config: DriverConfig = toml::from_str("[usb]\nauto_open = false\n").unwrap();

    assert_eq!(config.driver, DriverConfig::default().driver);
    assert!(!config.usb.auto_open);
    assert!(config.usb.set_boot_protocol);
    assert_eq!(config.usb.poll_timeout_ms, 100);

    let empty: DriverConfig = toml::from_str("").unwrap();
    assert_eq!(empty, DriverConfig::default());
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("driver.toml");

    let config: DriverConfig = toml::from_str(FULL_CONFIG).unwrap();
    config.save(&path).unwrap();

    let loaded = DriverConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_rejects_invalid_filter() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    std::fs::write(&path, "[usb]\nfilters = [\"046d:c077\"]\n").unwrap();

    let err = DriverConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("0x"));
}

#[test]
fn test_load_rejects_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("driver.toml");
    std::fs::write(&path, "[driver\nlog_level = ").unwrap();

    assert!(DriverConfig::load(Some(path)).is_err());
}

#[test]
fn test_load_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_expand_path_handles_tilde() {
    let expanded = DriverConfig::expand_path("~/driver.toml");
    if let Some(home) = dirs::home_dir() {
        assert_eq!(expanded, home.join("driver.toml"));
    }
    assert!(expanded.ends_with("driver.toml"));

    let plain = DriverConfig::expand_path("/etc/usbmouse/driver.toml");
    assert_eq!(plain.to_str(), Some("/etc/usbmouse/driver.toml"));
}

#[test]
fn test_manager_options_follow_usb_section() {
    let config: DriverConfig = toml::from_str(FULL_CONFIG).unwrap();
    let options = config.usb.manager_options();
    assert_eq!(options.filters.len(), 2);
    assert!(!options.auto_open);
}
