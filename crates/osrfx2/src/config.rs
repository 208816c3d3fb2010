//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// OSR FX2 learning kit VID:PID
pub const OSRFX2_FILTER: &str = "0x0547:0x1002";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns a device must match to be attached
    #[serde(default = "UsbSettings::default_filters")]
    pub filters: Vec<String>,
    /// First minor number handed out
    #[serde(default = "UsbSettings::default_minor_base")]
    pub minor_base: u32,
    /// Maximum number of boards attached at once
    #[serde(default = "UsbSettings::default_max_devices")]
    pub max_devices: u32,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Self::default_filters(),
            minor_base: Self::default_minor_base(),
            max_devices: Self::default_max_devices(),
        }
    }
}

impl UsbSettings {
    fn default_filters() -> Vec<String> {
        vec![OSRFX2_FILTER.to_string()]
    }

    fn default_minor_base() -> u32 {
        192
    }

    fn default_max_devices() -> u32 {
        16
    }
}

/// Per-transfer timing and queueing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk-in read timeout
    #[serde(default = "TransferSettings::default_io_timeout", with = "duration_serde")]
    pub read_timeout: Duration,
    /// Timeout for each queued bulk-out transfer
    #[serde(default = "TransferSettings::default_io_timeout", with = "duration_serde")]
    pub write_timeout: Duration,
    /// How long one interrupt poll waits before checking for cancellation
    #[serde(default = "TransferSettings::default_interrupt_poll", with = "duration_serde")]
    pub interrupt_poll: Duration,
    /// Bulk-out writes that may be queued ahead of the hardware
    #[serde(default = "TransferSettings::default_write_queue_depth")]
    pub write_queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_timeout: Self::default_io_timeout(),
            write_timeout: Self::default_io_timeout(),
            interrupt_poll: Self::default_interrupt_poll(),
            write_queue_depth: Self::default_write_queue_depth(),
        }
    }
}

impl TransferSettings {
    fn default_io_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_interrupt_poll() -> Duration {
        Duration::from_millis(50)
    }

    fn default_write_queue_depth() -> usize {
        32
    }
}

/// Serde adapter for human-readable durations ("10s", "1m30s", "250ms")
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h", "30m", "1m30s", "250ms"
    ///
    /// A trailing bare number counts as seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_ms: u64 = 0;
        let mut current_num = String::new();
        let mut chars = s.chars().peekable();

        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }

            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let scale = match c {
                'h' => 3_600_000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60_000,
                's' => 1_000,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_ms = num
                .checked_mul(scale)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration out of range: {}", s))?;
        }

        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_ms = num
                .checked_mul(1_000)
                .and_then(|ms| total_ms.checked_add(ms))
                .ok_or_else(|| format!("Duration out of range: {}", s))?;
        }

        if total_ms == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_millis(total_ms))
    }

    pub fn format_duration(d: Duration) -> String {
        let total_ms = d.as_millis();
        let hours = total_ms / 3_600_000;
        let mins = (total_ms % 3_600_000) / 60_000;
        let secs = (total_ms % 60_000) / 1_000;
        let ms = total_ms % 1_000;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 {
            result.push_str(&format!("{}s", secs));
        }
        if ms > 0 || result.is_empty() {
            result.push_str(&format!("{}ms", ms));
        }
        result
    }
}

impl DriverConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/osrfx2/osrfx2.toml"),
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

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("osrfx2").join("osrfx2.toml")
        } else {
            PathBuf::from(".config/osrfx2/osrfx2.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.usb.max_devices == 0 {
            return Err(anyhow!("usb.max_devices must be at least 1"));
        }
        if self.usb.minor_base.checked_add(self.usb.max_devices).is_none() {
            return Err(anyhow!(
                "usb.minor_base {} + max_devices {} overflows",
                self.usb.minor_base,
                self.usb.max_devices
            ));
        }

        let t = &self.transfers;
        for (name, value) in [
            ("read_timeout", t.read_timeout),
            ("write_timeout", t.write_timeout),
            ("interrupt_poll", t.interrupt_poll),
        ] {
            if value.is_zero() {
                return Err(anyhow!("transfers.{} must be greater than 0", name));
            }
        }
        if t.write_queue_depth == 0 {
            return Err(anyhow!("transfers.write_queue_depth must be at least 1"));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x0547:0x1002' or '0x0547:*')",
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

    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x0547')",
                    name,
                    id
                )
            })?;

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

/// Load a config file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
