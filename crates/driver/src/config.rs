//! Driver configuration management

use crate::usb::{ManagerOptions, RusbOptions};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

/// How reports are printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub output: OutputFormat,
    /// Depth of the command and event queues between the USB thread and the runtime
    #[serde(default = "DriverSettings::default_queue_depth")]
    pub event_queue_depth: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            output: OutputFormat::default(),
            event_queue_depth: Self::default_queue_depth(),
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_queue_depth() -> usize {
        common::DEFAULT_QUEUE_DEPTH
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID allow-list (e.g. "0x046d:*"); empty allows every boot mouse
    #[serde(default)]
    pub filters: Vec<String>,
    /// Start polling as soon as a mouse is attached
    #[serde(default = "UsbSettings::default_true")]
    pub auto_open: bool,
    #[serde(default = "UsbSettings::default_true")]
    pub detach_kernel_driver: bool,
    #[serde(default = "UsbSettings::default_true")]
    pub set_boot_protocol: bool,
    /// Length of one blocking interrupt read, in milliseconds
    #[serde(default = "UsbSettings::default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            auto_open: true,
            detach_kernel_driver: true,
            set_boot_protocol: true,
            poll_timeout_ms: Self::default_poll_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_true() -> bool {
        true
    }

    fn default_poll_timeout() -> u64 {
        100
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            filters: self.filters.clone(),
            auto_open: self.auto_open,
        }
    }

    pub fn rusb_options(&self) -> RusbOptions {
        RusbOptions {
            detach_kernel_driver: self.detach_kernel_driver,
            set_boot_protocol: self.set_boot_protocol,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the user configuration directory is tried first,
    /// then `/etc/usbmouse/driver.toml`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbmouse/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbmouse").join("driver.toml")
        } else {
            PathBuf::from(".config/usbmouse/driver.toml")
        }
    }

    /// Expand `~` in a user-supplied configuration path
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.driver.event_queue_depth == 0 {
            return Err(anyhow!("event_queue_depth must be greater than 0"));
        }

        if self.usb.poll_timeout_ms == 0 {
            return Err(anyhow!("poll_timeout_ms must be greater than 0"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x046d:0xc077' or '0x046d:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x046d')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
