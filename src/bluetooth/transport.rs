//! Platform BLE surface consumed by the link manager.
//!
//! Everything above this trait is platform independent. The Linux
//! implementation lives in [`crate::bluetooth::bluez`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{device::recognition::MacAddress, error::Result};

pub type Packet = SmallVec<[u8; 32]>;

/// Platform-assigned transport identifier, opaque to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub SmolStr);

impl DeviceId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// One advertisement sighting, or one entry of a device list query.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
   pub device_id: Option<DeviceId>,
   pub address: Option<MacAddress>,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub service_ids: Vec<Uuid>,
   /// Raw AD structures as broadcast.
   pub payload: Vec<u8>,
   pub device_class: Option<u32>,
}

impl Advertisement {
   pub fn id(&self) -> Option<DeviceId> {
      self
         .device_id
         .clone()
         .or_else(|| self.address.map(|a| DeviceId::new(a.to_string())))
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
   pub id: Uuid,
   pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicInfo {
   pub id: Uuid,
   pub read: bool,
   pub write: bool,
   pub write_without_response: bool,
   pub notify: bool,
   pub indicate: bool,
}

impl CharacteristicInfo {
   pub const fn writable(&self) -> bool {
      self.write || self.write_without_response
   }

   pub const fn notifiable(&self) -> bool {
      self.notify || self.indicate
   }
}

/// A characteristic within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
   pub service: Uuid,
   pub characteristic: Uuid,
}

#[async_trait]
pub trait Transport: Send + Sync {
   /// Starts discovery. The stream ends when scanning stops.
   async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>>;
   async fn stop_scan(&self) -> Result<()>;
   /// Devices the platform has already seen.
   async fn discovered_devices(&self) -> Result<Vec<Advertisement>>;

   async fn connect(&self, device: &DeviceId) -> Result<()>;
   async fn disconnect(&self, device: &DeviceId) -> Result<()>;

   async fn services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>>;
   async fn characteristics(&self, device: &DeviceId, service: Uuid) -> Result<Vec<CharacteristicInfo>>;

   async fn write(&self, device: &DeviceId, endpoint: Endpoint, data: &[u8]) -> Result<()>;
   async fn read(&self, device: &DeviceId, endpoint: Endpoint) -> Result<Packet>;
   /// Notification values; the stream ends when the link goes away.
   async fn subscribe(&self, device: &DeviceId, endpoint: Endpoint) -> Result<BoxStream<'static, Packet>>;

   /// Devices currently connected at the platform level, by anyone.
   async fn connected_devices(&self) -> Result<Vec<Advertisement>>;
   /// Connection state changes of one device (`true` = connected).
   async fn connection_events(&self, device: &DeviceId) -> Result<BoxStream<'static, bool>>;
}
