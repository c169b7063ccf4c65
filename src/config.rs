//! Configuration management for the link manager.
//!
//! This module handles loading and saving configuration from disk: link
//! timings, allow-list service settings, host identity and preferred devices.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
   #[serde(default)]
   pub link: LinkConfig,

   #[serde(default)]
   pub whitelist: WhitelistConfig,

   #[serde(default)]
   pub host: HostConfig,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,
}

/// Represents a preferred device.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

/// Timings and switches of the connection state machine.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LinkConfig {
   pub connect_timeout_secs: u64,
   pub settle_delay_ms: u64,
   pub busy_retries: u32,
   pub busy_retry_delay_ms: u64,
   pub notification_retries: u32,
   pub notification_retry_delay_ms: u64,
   pub handshake_spacing_ms: u64,
   pub heartbeat_interval_secs: u64,
   pub liveness_interval_secs: u64,
   pub silence_threshold_secs: u64,
   pub reconnect_max_attempts: u32,
   pub reconnect_base_delay_ms: u64,
   pub reconnect_max_delay_ms: u64,
   pub auto_reconnect: bool,
   pub exclusive_mode: bool,
   pub exclusive_poll_secs: u64,
   pub auto_connect: bool,
   pub scan_poll_secs: u64,
   pub dialect_response_timeout_ms: u64,
}

impl Default for LinkConfig {
   fn default() -> Self {
      Self {
         connect_timeout_secs: 15,
         settle_delay_ms: 500,
         busy_retries: 3,
         busy_retry_delay_ms: 1000,
         notification_retries: 3,
         notification_retry_delay_ms: 1000,
         handshake_spacing_ms: 200,
         heartbeat_interval_secs: 10,
         liveness_interval_secs: 15,
         silence_threshold_secs: 30,
         reconnect_max_attempts: 5,
         reconnect_base_delay_ms: 1000,
         reconnect_max_delay_ms: 5000,
         auto_reconnect: true,
         exclusive_mode: true,
         exclusive_poll_secs: 5,
         auto_connect: false,
         scan_poll_secs: 3,
         dialect_response_timeout_ms: 1000,
      }
   }
}

impl LinkConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }

   pub const fn settle_delay(&self) -> Duration {
      Duration::from_millis(self.settle_delay_ms)
   }

   pub const fn busy_retry_delay(&self) -> Duration {
      Duration::from_millis(self.busy_retry_delay_ms)
   }

   pub const fn notification_retry_delay(&self) -> Duration {
      Duration::from_millis(self.notification_retry_delay_ms)
   }

   pub const fn handshake_spacing(&self) -> Duration {
      Duration::from_millis(self.handshake_spacing_ms)
   }

   pub const fn heartbeat_interval(&self) -> Duration {
      Duration::from_secs(self.heartbeat_interval_secs)
   }

   pub const fn liveness_interval(&self) -> Duration {
      Duration::from_secs(self.liveness_interval_secs)
   }

   pub const fn silence_threshold(&self) -> Duration {
      Duration::from_secs(self.silence_threshold_secs)
   }

   pub const fn exclusive_poll(&self) -> Duration {
      Duration::from_secs(self.exclusive_poll_secs)
   }

   pub const fn scan_poll(&self) -> Duration {
      Duration::from_secs(self.scan_poll_secs)
   }

   pub const fn dialect_response_timeout(&self) -> Duration {
      Duration::from_millis(self.dialect_response_timeout_ms)
   }
}

/// Remote allow-list service settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WhitelistConfig {
   /// When false the remote tier is skipped entirely.
   pub enabled: bool,
   pub base_url: String,
   pub auth_token: Option<String>,
   /// Disables the hardcoded name tier.
   pub strict_mode: bool,
   pub cache_ttl_secs: u64,
   pub failure_cooldown_secs: u64,
   pub verify_timeout_secs: u64,
   pub fetch_timeout_secs: u64,
   pub fallback_names: Vec<String>,
}

impl Default for WhitelistConfig {
   fn default() -> Self {
      Self {
         enabled: true,
         base_url: "http://127.0.0.1:8080/api".to_string(),
         auth_token: None,
         strict_mode: false,
         cache_ttl_secs: 30 * 60,
         failure_cooldown_secs: 2 * 60,
         verify_timeout_secs: 3,
         fetch_timeout_secs: 15,
         fallback_names: default_fallback_names(),
      }
   }
}

fn default_fallback_names() -> Vec<String> {
   [
      "BT-Music", "BT-Audio", "BT-Sound", "BT-Player", "Music-BT", "Audio-BT", "medsleep",
   ]
   .into_iter()
   .map(String::from)
   .collect()
}

/// Identity of the machine running the daemon, used to recognize audio
/// routed back through the host itself.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct HostConfig {
   pub model: Option<String>,
   pub brand: Option<String>,
}

impl HostConfig {
   /// Fills unset fields from DMI.
   pub fn detect(mut self) -> Self {
      const DMI: &str = "/sys/class/dmi/id";
      let read = |file: &str| {
         fs::read_to_string(PathBuf::from(DMI).join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
      };
      if self.model.is_none() {
         self.model = read("product_name");
      }
      if self.brand.is_none() {
         self.brand = read("sys_vendor");
      }
      self
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("SLEEPLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("sleeplink").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
         .map(|d| d.name.as_str())
   }
}
