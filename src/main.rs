//! Sleep-aid accessory link D-Bus service
//!
//! This service discovers BLE sleep-aid accessories, checks them against the
//! remote allow-list, and keeps a single authorized link alive. Front ends
//! drive it over D-Bus and receive telemetry and state changes as signals.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use serde::Serialize;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{bluez::BluezTransport, manager::LinkManager, transport::DeviceId};
use dbus::SleepLinkService;
use event::{EventBus, LinkEvent};
use whitelist::{client::HttpAllowList, store::WhitelistStore, validator::AuthorizationValidator};

mod bluetooth;
mod config;
mod dbus;
mod device;
mod error;
mod event;
#[cfg(test)]
mod testing;
mod whitelist;

use crate::{dbus::SleepLinkServiceSignals, error::Result};

const SERVICE_NAME: &str = "org.sleeplink";
const OBJECT_PATH: &str = "/org/sleeplink/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting sleeplink D-Bus service...");

   // Load configuration
   let mut config = config::Config::load().unwrap_or_else(|e| {
      warn!("Failed to load configuration, using defaults: {e}");
      config::Config::default()
   });
   config.host = std::mem::take(&mut config.host).detect();
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   // Allow-list cache and capture history
   let store = WhitelistStore::open()
      .inspect_err(|e| warn!("Persistent store unavailable, running without it: {e}"))
      .ok();

   let allow_list = Arc::new(HttpAllowList::new(&config.whitelist)?);
   let validator = Arc::new(AuthorizationValidator::new(
      allow_list,
      store.clone(),
      config.whitelist.clone(),
      config.host.clone(),
   ));

   // Create event channel
   let event_bus = EventProcessor::new();

   let transport = Arc::new(BluezTransport::new().await?);
   let manager = LinkManager::new(event_bus.clone(), config, transport, validator.clone(), store);

   // Create D-Bus service
   let service = SleepLinkService::new(manager, validator);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("sleeplink D-Bus service started at {SERVICE_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down sleeplink service...");

   Ok(())
}

fn json<T: Serialize>(value: &T) -> String {
   serde_json::to_string(value).unwrap_or_default()
}

struct EventProcessor {
   queue: SegQueue<(DeviceId, LinkEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(DeviceId, LinkEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<SleepLinkService>,
      (device, event): (DeviceId, LinkEvent),
   ) -> Result<()> {
      let id = device.as_str();
      match event {
         LinkEvent::DeviceFound(record) => {
            iface.device_found(&json(&record)).await?;
         },
         LinkEvent::StateChanged(state) => {
            iface.state_changed(id, state.into()).await?;
         },
         LinkEvent::Connected => {
            iface.device_connected(id).await?;
         },
         LinkEvent::Disconnected { message } => {
            iface.device_disconnected(id, &message).await?;
         },
         LinkEvent::ConnectFailed { message } => {
            iface.connect_failed(id, &message).await?;
         },
         LinkEvent::Telemetry(frame) => {
            iface
               .telemetry(id, frame.opcode, frame.arg1, frame.arg2)
               .await?;
         },
         LinkEvent::StatusUpdated(status) => {
            iface.status_updated(&json(&status)).await?;
         },
         LinkEvent::ForeignCapture { record, prompt } => {
            iface
               .foreign_capture(&record.device_id, &record.name, &prompt)
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SleepLinkService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &DeviceId, event: LinkEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
