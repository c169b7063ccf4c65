//! Error types for the link manager.
//!
//! Besides the usual plumbing failures (D-Bus, I/O, configuration, store),
//! this module carries the connection failure taxonomy and the mapping from
//! raw platform error codes to messages a user can act on.

use std::borrow::Cow;

use smol_str::SmolStr;
use thiserror::Error;

use crate::whitelist::validator::VerdictReason;

/// Platform code: adapter switched off or missing.
pub const CODE_ADAPTER_OFF: i32 = 10001;
/// Platform code: device not found.
pub const CODE_NOT_FOUND: i32 = 10002;
/// Platform code: connection refused, usually because another app holds it.
pub const CODE_CONNECTION_FAIL: i32 = 10003;
/// Platform code: operation timed out.
pub const CODE_TIMEOUT: i32 = 10013;
/// Platform code: occupied by the system connection.
pub const CODE_SYSTEM_OCCUPIED: i32 = -1;

/// Main error type for the link manager.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth adapter unavailable: {0}")]
   TransportUnavailable(SmolStr),

   #[error("Device is occupied by another connection")]
   DeviceOccupied,

   #[error("GATT service discovery timed out")]
   DiscoveryTimeout,

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("No usable GATT service found")]
   ServiceNotFound,

   #[error("No usable characteristic found")]
   CharacteristicNotFound,

   #[error("Device not authorized: {0}")]
   AuthorizationDenied(VerdictReason),

   #[error("Authorization service unavailable: {0}")]
   AuthorizationServiceUnavailable(SmolStr),

   #[error("Device disconnected unexpectedly")]
   UnexpectedDisconnect,

   #[error("Reconnect gave up after {attempts} attempts")]
   ReconnectExhausted { attempts: u32 },

   #[error("Platform error {code}: {message}")]
   Platform { code: i32, message: SmolStr },

   #[error("No active connection")]
   NotConnected,

   #[error("Connected device has no writable characteristic")]
   NotWritable,

   #[error("Connection attempt superseded by a newer one")]
   Superseded,

   #[error("Connection attempt cancelled")]
   Cancelled,

   #[error("Request timeout")]
   Timeout,

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("HTTP error: {0}")]
   Http(#[from] reqwest::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Store error: {0}")]
   Store(#[from] heed::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl LinkError {
   /// Builds an error from a raw platform code, promoting the codes that have
   /// a dedicated variant.
   pub fn platform(code: i32, message: impl Into<SmolStr>) -> Self {
      let message = message.into();
      match code {
         CODE_ADAPTER_OFF => Self::TransportUnavailable(message),
         CODE_TIMEOUT => Self::Timeout,
         _ => Self::Platform { code, message },
      }
   }

   /// True when the device is held by another app or the OS. These errors are
   /// retried a few times before surfacing as [`LinkError::DeviceOccupied`].
   pub const fn is_busy(&self) -> bool {
      matches!(
         self,
         Self::DeviceOccupied
            | Self::Platform {
               code: CODE_CONNECTION_FAIL | CODE_SYSTEM_OCCUPIED,
               ..
            }
      )
   }

   /// Human readable reason for the failure.
   pub fn user_message(&self) -> Cow<'static, str> {
      match self {
         Self::TransportUnavailable(_) => "Bluetooth is not enabled, turn it on and retry".into(),
         Self::DeviceOccupied => {
            "Device is occupied, most likely by the system Bluetooth connection. \
             Disconnect it in system settings and retry"
               .into()
         },
         Self::DiscoveryTimeout => "Device did not list its services in time, reconnect the device".into(),
         Self::DeviceNotFound(_) => platform_message(CODE_NOT_FOUND),
         Self::ServiceNotFound | Self::CharacteristicNotFound => {
            "Device service is abnormal, reconnect the device".into()
         },
         Self::AuthorizationDenied(reason) => match reason {
            VerdictReason::QuotaExhausted => {
               "Device has reached its maximum number of bound users".into()
            },
            _ => "Device is not on the authorized device list".into(),
         },
         Self::UnexpectedDisconnect => platform_message(10006),
         Self::ReconnectExhausted { .. } => {
            "Connection lost and could not be restored, reconnect manually".into()
         },
         Self::Timeout => platform_message(CODE_TIMEOUT),
         Self::Platform { code, .. } => platform_message(*code),
         Self::NotConnected => "Device is not connected".into(),
         other => Cow::Owned(other.to_string()),
      }
   }
}

/// Maps a platform error code to a message. Unknown codes keep the raw code.
pub fn platform_message(code: i32) -> Cow<'static, str> {
   match code {
      CODE_ADAPTER_OFF => "Bluetooth is not enabled".into(),
      CODE_NOT_FOUND => "Device not found".into(),
      CODE_CONNECTION_FAIL => "Connection failed, the device may be used by another app".into(),
      10004 | 10005 => "Device service is abnormal".into(),
      10006 => "Device disconnected".into(),
      10012 => "Operation not available".into(),
      CODE_TIMEOUT => "Connection timed out".into(),
      CODE_SYSTEM_OCCUPIED => {
         "Device is occupied, check the system Bluetooth connection".into()
      },
      other => Cow::Owned(format!("connection failed (code {other})")),
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_known_codes_have_messages() {
      assert_eq!(platform_message(10001), "Bluetooth is not enabled");
      assert_eq!(platform_message(10005), "Device service is abnormal");
      assert!(platform_message(-1).contains("occupied"));
   }

   #[test]
   fn test_unknown_code_keeps_raw_code() {
      assert_eq!(platform_message(4242), "connection failed (code 4242)");
      let err = LinkError::platform(4242, "boom");
      assert_eq!(err.user_message(), "connection failed (code 4242)");
   }

   #[test]
   fn test_link_loss_messages() {
      assert_eq!(LinkError::UnexpectedDisconnect.user_message(), "Device disconnected");
      assert!(LinkError::DiscoveryTimeout.user_message().contains("services"));
      assert!(!LinkError::DiscoveryTimeout.is_busy());
   }

   #[test]
   fn test_busy_classification() {
      assert!(LinkError::platform(10003, "busy").is_busy());
      assert!(LinkError::platform(-1, "system").is_busy());
      assert!(!LinkError::platform(10002, "gone").is_busy());
      assert!(matches!(
         LinkError::platform(10001, "off"),
         LinkError::TransportUnavailable(_)
      ));
   }
}
