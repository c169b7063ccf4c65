//! Device discovery.
//!
//! Merges the event-driven advertisement stream with periodic polls of the
//! platform's discovered-device list, deduplicates by device id and enriches
//! anonymous advertisements with an inferred display name.

use std::{
   collections::{BTreeSet, HashMap},
   sync::Arc,
   time::Duration,
};

use futures::{StreamExt, stream};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{Advertisement, DeviceId, Transport},
   device::recognition::{self, MacAddress},
   error::Result,
};

/// Delay before the first poll of the discovered-device list.
const FIRST_POLL_DELAY: Duration = Duration::from_secs(1);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Advisory pre-filter toggles. They only mark records as preferred, the
/// allow-list stays the authoritative gate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanFilter {
   pub audio_only: bool,
   pub name_prefix_only: bool,
}

/// Identity discovered during scanning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
   pub device_id: DeviceId,
   pub mac_address: Option<MacAddress>,
   pub display_name: SmolStr,
   pub signal_strength: Option<i16>,
   pub advertised_service_ids: BTreeSet<Uuid>,
   pub device_class: Option<u32>,
   /// Passes the active pre-filter.
   pub preferred: bool,
}

impl DeviceRecord {
   pub fn from_advertisement(id: DeviceId, adv: &Advertisement) -> Self {
      let mac_address = adv
         .address
         .or_else(|| MacAddress::from_device_id(id.as_str()));
      let display_name = recognition::resolve_name(
         adv.name.as_deref(),
         &adv.payload,
         mac_address.as_ref(),
         adv.device_class,
      )
      .unwrap_or_default();
      Self {
         device_id: id,
         mac_address,
         display_name,
         signal_strength: adv.rssi,
         advertised_service_ids: adv.service_ids.iter().copied().collect(),
         device_class: adv.device_class,
         preferred: true,
      }
   }

   pub fn has_name(&self) -> bool {
      !recognition::is_placeholder_name(&self.display_name)
   }

   fn apply_filter(&mut self, filter: ScanFilter) {
      let services: Vec<Uuid> = self.advertised_service_ids.iter().copied().collect();
      let audio = !filter.audio_only
         || recognition::looks_like_audio(&self.display_name, &services, self.device_class);
      let named =
         !filter.name_prefix_only || recognition::follows_name_convention(&self.display_name);
      self.preferred = audio && named;
   }
}

/// Dedupe table of one scan run.
#[derive(Default)]
struct ScanState {
   filter: ScanFilter,
   records: HashMap<DeviceId, DeviceRecord>,
}

impl ScanState {
   /// Returns the record when it is new or changed.
   fn observe(&mut self, adv: &Advertisement) -> Option<DeviceRecord> {
      let id = adv.id()?;
      let Some(record) = self.records.get_mut(&id) else {
         let mut record = DeviceRecord::from_advertisement(id.clone(), adv);
         record.apply_filter(self.filter);
         debug!(
            "Discovered {id} {:?} rssi={:?}",
            record.display_name, record.signal_strength
         );
         self.records.insert(id, record.clone());
         return Some(record);
      };

      let mut changed = false;
      if !record.has_name() {
         let fresh = DeviceRecord::from_advertisement(id, adv);
         if fresh.has_name() {
            record.display_name = fresh.display_name;
            changed = true;
         }
      }
      if adv.rssi.is_some() && adv.rssi != record.signal_strength {
         record.signal_strength = adv.rssi;
         changed = true;
      }
      for service in &adv.service_ids {
         changed |= record.advertised_service_ids.insert(*service);
      }
      if changed {
         record.apply_filter(self.filter);
      }
      changed.then(|| record.clone())
   }
}

/// Drives discovery on the transport.
pub struct Scanner {
   transport: Arc<dyn Transport>,
   poll_interval: Duration,
   task: Option<JoinHandle<()>>,
}

impl Scanner {
   pub fn new(transport: Arc<dyn Transport>, poll_interval: Duration) -> Self {
      Self {
         transport,
         poll_interval,
         task: None,
      }
   }

   pub fn is_scanning(&self) -> bool {
      self.task.as_ref().is_some_and(|t| !t.is_finished())
   }

   /// Starts a fresh scan run and returns its record stream. A running scan is
   /// stopped first.
   pub async fn start(&mut self, filter: ScanFilter) -> Result<mpsc::Receiver<DeviceRecord>> {
      self.stop().await;
      let events = self.transport.start_scan().await?;
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      info!(
         "Scanning (audio_only={}, name_prefix_only={})",
         filter.audio_only, filter.name_prefix_only
      );
      self.task = Some(tokio::spawn(Self::run(
         self.transport.clone(),
         events,
         filter,
         self.poll_interval,
         tx,
      )));
      Ok(rx)
   }

   /// Stops scanning and discards the dedupe table.
   pub async fn stop(&mut self) {
      let Some(task) = self.task.take() else {
         return;
      };
      task.abort();
      if let Err(e) = self.transport.stop_scan().await {
         warn!("Failed to stop scan: {e}");
      }
      info!("Scan stopped");
   }

   async fn run(
      transport: Arc<dyn Transport>,
      mut events: stream::BoxStream<'static, Advertisement>,
      filter: ScanFilter,
      poll_interval: Duration,
      tx: mpsc::Sender<DeviceRecord>,
   ) {
      let mut state = ScanState {
         filter,
         ..ScanState::default()
      };
      let mut poll = time::interval_at(Instant::now() + FIRST_POLL_DELAY, poll_interval);
      poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         let sightings = select! {
            adv = events.next() => match adv {
               Some(adv) => vec![adv],
               None => {
                  debug!("Advertisement stream ended, polling only");
                  events = stream::pending().boxed();
                  continue;
               },
            },
            _ = poll.tick() => match transport.discovered_devices().await {
               Ok(devices) => devices,
               Err(e) => {
                  debug!("Discovered-device poll failed: {e}");
                  continue;
               },
            },
         };
         for adv in &sightings {
            if let Some(record) = state.observe(adv)
               && tx.send(record).await.is_err()
            {
               return;
            }
         }
      }
   }
}

impl Drop for Scanner {
   fn drop(&mut self) {
      if let Some(task) = self.task.take() {
         task.abort();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::FakeTransport;

   fn adv(id: &str, name: Option<&str>, rssi: i16) -> Advertisement {
      Advertisement {
         device_id: Some(DeviceId::new(id)),
         name: name.map(SmolStr::new),
         rssi: Some(rssi),
         ..Advertisement::default()
      }
   }

   #[test]
   fn test_resighting_updates() {
      let mut state = ScanState::default();
      let first = state.observe(&adv("dev_1", None, -80)).unwrap();
      assert!(!first.has_name());

      // same sighting again is not re-emitted
      assert!(state.observe(&adv("dev_1", None, -80)).is_none());

      let named = state.observe(&adv("dev_1", Some("BT-Music"), -80)).unwrap();
      assert_eq!(named.display_name, "BT-Music");

      // a known name is never replaced, rssi always is
      let moved = state.observe(&adv("dev_1", Some("Other"), -60)).unwrap();
      assert_eq!(moved.display_name, "BT-Music");
      assert_eq!(moved.signal_strength, Some(-60));
      assert_eq!(state.records.len(), 1);
   }

   #[test]
   fn test_filters_never_suppress() {
      let mut state = ScanState {
         filter: ScanFilter {
            audio_only: true,
            name_prefix_only: true,
         },
         ..ScanState::default()
      };
      let lamp = state.observe(&adv("dev_2", Some("Desk Lamp"), -50)).unwrap();
      assert!(!lamp.preferred);
      let music = state.observe(&adv("dev_3", Some("BT-Music"), -50)).unwrap();
      assert!(music.preferred);
   }

   #[test]
   fn test_payload_name_and_derived_mac() {
      let mut payload = vec![0x09, 0x08];
      payload.extend_from_slice(b"BT-Music");
      let sighting = Advertisement {
         device_id: Some(DeviceId::new("/org/bluez/hci0/dev_11_29_AA_25_4A_58")),
         name: Some("".into()),
         payload,
         ..Advertisement::default()
      };
      let record = ScanState::default().observe(&sighting).unwrap();
      assert_eq!(record.display_name, "BT-Music");
      assert_eq!(record.mac_address, MacAddress::parse("11:29:AA:25:4A:58"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_poll_catches_quiet_devices() {
      let transport = Arc::new(FakeTransport::new());
      transport.add_discovered(adv("dev_quiet", Some("BT-Sound"), -70));
      let mut scanner = Scanner::new(transport.clone(), Duration::from_secs(3));

      let mut records = scanner.start(ScanFilter::default()).await.unwrap();
      transport.advertise(adv("dev_loud", Some("BT-Audio"), -40));

      let first = records.recv().await.unwrap();
      assert_eq!(first.device_id.as_str(), "dev_loud");
      let second = records.recv().await.unwrap();
      assert_eq!(second.device_id.as_str(), "dev_quiet");

      scanner.stop().await;
      assert!(!scanner.is_scanning());
      assert!(records.recv().await.is_none());
   }
}
