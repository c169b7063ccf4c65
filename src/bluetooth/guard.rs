//! Exclusive access guard.
//!
//! While a session is ready, the platform's connected-device list is polled
//! for allow-listed accessories held by a connection outside the manager. The
//! guard only observes: it prompts the user once per device and keeps a short
//! log of occurrences, it never disconnects anything itself.

use std::collections::HashSet;

use heapless::Deque;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::transport::{DeviceId, Transport},
   device::recognition::{self, MacAddress},
   whitelist::validator::{AuthorizationValidator, VerdictSource, unix_now},
};

/// Number of capture occurrences remembered.
pub const CAPTURE_LOG_SIZE: usize = 10;

/// One foreign-capture occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
   pub device_id: SmolStr,
   pub name: SmolStr,
   pub mac: Option<MacAddress>,
   /// Unix seconds.
   pub seen_at: u64,
}

impl CaptureRecord {
   pub fn prompt(&self) -> String {
      format!(
         "{} is connected outside this application. Disconnect it in the system \
          Bluetooth settings, then connect it here again.",
         self.name
      )
   }
}

/// Queries connected devices and returns the allow-listed ones other than
/// `owned`.
pub async fn find_foreign_captures(
   transport: &dyn Transport,
   validator: &AuthorizationValidator,
   owned: &DeviceId,
) -> Vec<CaptureRecord> {
   let connected = match transport.connected_devices().await {
      Ok(devices) => devices,
      Err(e) => {
         debug!("Connected-device query failed: {e}");
         return Vec::new();
      },
   };

   let mut captures = Vec::new();
   for device in connected {
      let Some(id) = device.id() else {
         continue;
      };
      if &id == owned {
         continue;
      }
      let mac = device
         .address
         .or_else(|| MacAddress::from_device_id(id.as_str()));
      let name = recognition::resolve_name(
         device.name.as_deref(),
         &device.payload,
         mac.as_ref(),
         device.device_class,
      )
      .unwrap_or_default();
      let verdict = validator.verify(mac.as_ref(), &name).await;
      // the host's own output is not an accessory
      if verdict.is_allowed() && verdict.source() != VerdictSource::SelfDevice {
         captures.push(CaptureRecord {
            device_id: id.0,
            name,
            mac,
            seen_at: unix_now(),
         });
      }
   }
   captures
}

/// Prompt bookkeeping and the bounded occurrence log.
#[derive(Default)]
pub struct ExclusiveAccessGuard {
   prompted: HashSet<SmolStr>,
   recent: Deque<CaptureRecord, CAPTURE_LOG_SIZE>,
}

impl ExclusiveAccessGuard {
   pub fn with_history(history: impl IntoIterator<Item = CaptureRecord>) -> Self {
      let mut guard = Self::default();
      for record in history {
         guard.log(record);
      }
      guard
   }

   /// Logs the occurrence and returns `true` when the user has not been
   /// prompted about this device yet.
   pub fn record(&mut self, capture: CaptureRecord) -> bool {
      warn!(
         "{} ({}) is held by a connection outside the manager",
         capture.name, capture.device_id
      );
      let first = self.prompted.insert(capture.device_id.clone());
      self.log(capture);
      first
   }

   fn log(&mut self, capture: CaptureRecord) {
      let kept: Vec<CaptureRecord> = self
         .recent
         .iter()
         .filter(|r| r.device_id != capture.device_id)
         .cloned()
         .collect();
      self.recent.clear();
      for record in kept {
         let _ = self.recent.push_back(record);
      }
      if self.recent.is_full() {
         self.recent.pop_front();
      }
      let _ = self.recent.push_back(capture);
   }

   /// Forgets prompts so a new session prompts again.
   pub fn reset_prompts(&mut self) {
      self.prompted.clear();
   }

   /// Oldest first.
   pub fn recent(&self) -> Vec<CaptureRecord> {
      self.recent.iter().cloned().collect()
   }
}
