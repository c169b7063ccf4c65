//! [`Transport`] on top of BlueZ.
//!
//! Devices are identified by their address string. GATT objects are looked up
//! by UUID on every call, so a rediscovered device never leaves stale handles
//! behind.

use std::time::Duration;

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session,
   gatt::remote::Characteristic,
};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::time;
use uuid::Uuid;

use crate::{
   bluetooth::transport::{
      Advertisement, CharacteristicInfo, DeviceId, Endpoint, Packet, ServiceInfo, Transport,
   },
   device::recognition::MacAddress,
   error::{
      CODE_ADAPTER_OFF, CODE_CONNECTION_FAIL, CODE_NOT_FOUND, LinkError, Result,
   },
};

/// Polling step while BlueZ resolves the GATT database after a connect.
const SERVICES_RESOLVE_STEP: Duration = Duration::from_millis(100);
/// Upper bound for GATT resolution.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Translates BlueZ errors into platform codes where one applies.
fn platform_error(e: bluer::Error) -> LinkError {
   let code = match &e.kind {
      ErrorKind::NotReady => CODE_ADAPTER_OFF,
      ErrorKind::DoesNotExist | ErrorKind::NotFound => CODE_NOT_FOUND,
      ErrorKind::ConnectionAttemptFailed | ErrorKind::InProgress => CODE_CONNECTION_FAIL,
      ErrorKind::ServicesUnresolved => 10004,
      ErrorKind::NotSupported | ErrorKind::NotPermitted | ErrorKind::NotAuthorized => 10012,
      _ => return LinkError::Bluetooth(e),
   };
   LinkError::platform(code, e.message)
}

/// Rebuilds the raw AD structures from BlueZ's parsed advertising data.
fn encode_ad_structures(data: &std::collections::HashMap<u8, Vec<u8>>) -> Vec<u8> {
   let mut types: Vec<_> = data.keys().copied().collect();
   types.sort_unstable();
   let mut payload = Vec::new();
   for ad_type in types {
      let value = &data[&ad_type];
      let Ok(len) = u8::try_from(value.len() + 1) else {
         continue;
      };
      payload.push(len);
      payload.push(ad_type);
      payload.extend_from_slice(value);
   }
   payload
}

async fn advertisement(device: &Device) -> Advertisement {
   let address = device.address();
   let payload = match device.advertising_data().await {
      Ok(Some(data)) => encode_ad_structures(&data),
      _ => Vec::new(),
   };
   Advertisement {
      device_id: Some(DeviceId::new(address.to_string())),
      address: MacAddress::parse(&address.to_string()),
      name: device.name().await.ok().flatten().map(SmolStr::from),
      rssi: device.rssi().await.ok().flatten(),
      service_ids: device
         .uuids()
         .await
         .ok()
         .flatten()
         .map(|ids| ids.into_iter().collect())
         .unwrap_or_default(),
      payload,
      device_class: device.class().await.ok().flatten(),
   }
}

pub struct BluezTransport {
   _session: Session,
   adapter: Adapter,
}

impl BluezTransport {
   /// Opens the default adapter, powering it on if needed.
   pub async fn new() -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await.map_err(platform_error)?;
      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         adapter.set_powered(true).await.map_err(|e| {
            warn!("Failed to power on adapter {}: {e}", adapter.name());
            LinkError::TransportUnavailable(adapter.name().into())
         })?;
         info!("Powered on adapter {}", adapter.name());
      }
      info!("Using adapter {}", adapter.name());
      Ok(Self {
         _session: session,
         adapter,
      })
   }

   fn device(&self, id: &DeviceId) -> Result<Device> {
      let address: Address = id
         .as_str()
         .parse()
         .map_err(|_| LinkError::DeviceNotFound(id.0.clone()))?;
      self.adapter.device(address).map_err(platform_error)
   }

   async fn wait_services_resolved(&self, device: &Device) -> Result<()> {
      let deadline = time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
      while !device.is_services_resolved().await.map_err(platform_error)? {
         if time::Instant::now() >= deadline {
            return Err(LinkError::platform(10004, "GATT services not resolved"));
         }
         time::sleep(SERVICES_RESOLVE_STEP).await;
      }
      Ok(())
   }

   async fn characteristic(&self, id: &DeviceId, endpoint: Endpoint) -> Result<Characteristic> {
      let device = self.device(id)?;
      for service in device.services().await.map_err(platform_error)? {
         if service.uuid().await.map_err(platform_error)? != endpoint.service {
            continue;
         }
         for characteristic in service.characteristics().await.map_err(platform_error)? {
            if characteristic.uuid().await.map_err(platform_error)? == endpoint.characteristic {
               return Ok(characteristic);
            }
         }
      }
      Err(LinkError::CharacteristicNotFound)
   }
}

#[async_trait]
impl Transport for BluezTransport {
   async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>> {
      let events = self.adapter.discover_devices().await.map_err(platform_error)?;
      let adapter = self.adapter.clone();
      let sightings = events.filter_map(move |event| {
         let adapter = adapter.clone();
         async move {
            let AdapterEvent::DeviceAdded(address) = event else {
               return None;
            };
            let device = adapter.device(address).ok()?;
            Some(advertisement(&device).await)
         }
      });
      Ok(sightings.boxed())
   }

   async fn stop_scan(&self) -> Result<()> {
      // discovery ends when the event stream is dropped
      debug!("Discovery on {} released", self.adapter.name());
      Ok(())
   }

   async fn discovered_devices(&self) -> Result<Vec<Advertisement>> {
      let mut devices = Vec::new();
      for address in self.adapter.device_addresses().await.map_err(platform_error)? {
         if let Ok(device) = self.adapter.device(address) {
            devices.push(advertisement(&device).await);
         }
      }
      Ok(devices)
   }

   async fn connect(&self, id: &DeviceId) -> Result<()> {
      let device = self.device(id)?;
      match device.connect().await {
         Ok(()) => {},
         Err(e) if matches!(e.kind, ErrorKind::AlreadyConnected) => debug!("{id} already connected"),
         Err(e) => return Err(platform_error(e)),
      }
      self.wait_services_resolved(&device).await
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<()> {
      let device = self.device(id)?;
      if device.is_connected().await.unwrap_or(false) {
         device.disconnect().await.map_err(platform_error)?;
      }
      Ok(())
   }

   async fn services(&self, id: &DeviceId) -> Result<Vec<ServiceInfo>> {
      let device = self.device(id)?;
      let mut services = Vec::new();
      for service in device.services().await.map_err(platform_error)? {
         services.push(ServiceInfo {
            id: service.uuid().await.map_err(platform_error)?,
            primary: service.primary().await.unwrap_or(true),
         });
      }
      Ok(services)
   }

   async fn characteristics(&self, id: &DeviceId, service_id: Uuid) -> Result<Vec<CharacteristicInfo>> {
      let device = self.device(id)?;
      for service in device.services().await.map_err(platform_error)? {
         if service.uuid().await.map_err(platform_error)? != service_id {
            continue;
         }
         let mut chars = Vec::new();
         for characteristic in service.characteristics().await.map_err(platform_error)? {
            let flags = characteristic.flags().await.map_err(platform_error)?;
            chars.push(CharacteristicInfo {
               id: characteristic.uuid().await.map_err(platform_error)?,
               read: flags.read,
               write: flags.write,
               write_without_response: flags.write_without_response,
               notify: flags.notify,
               indicate: flags.indicate,
            });
         }
         return Ok(chars);
      }
      Err(LinkError::ServiceNotFound)
   }

   async fn write(&self, id: &DeviceId, endpoint: Endpoint, data: &[u8]) -> Result<()> {
      let characteristic = self.characteristic(id, endpoint).await?;
      characteristic.write(data).await.map_err(platform_error)
   }

   async fn read(&self, id: &DeviceId, endpoint: Endpoint) -> Result<Packet> {
      let characteristic = self.characteristic(id, endpoint).await?;
      let value = characteristic.read().await.map_err(platform_error)?;
      Ok(Packet::from_vec(value))
   }

   async fn subscribe(&self, id: &DeviceId, endpoint: Endpoint) -> Result<BoxStream<'static, Packet>> {
      let characteristic = self.characteristic(id, endpoint).await?;
      let values = characteristic.notify().await.map_err(platform_error)?;
      Ok(values.map(Packet::from_vec).boxed())
   }

   async fn connected_devices(&self) -> Result<Vec<Advertisement>> {
      let mut devices = Vec::new();
      for address in self.adapter.device_addresses().await.map_err(platform_error)? {
         if let Ok(device) = self.adapter.device(address)
            && device.is_connected().await == Ok(true)
         {
            devices.push(advertisement(&device).await);
         }
      }
      Ok(devices)
   }

   async fn connection_events(&self, id: &DeviceId) -> Result<BoxStream<'static, bool>> {
      let device = self.device(id)?;
      let events = device.events().await.map_err(platform_error)?;
      let changes = events.filter_map(|event| async move {
         match event {
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => Some(connected),
            _ => None,
         }
      });
      Ok(changes.boxed())
   }
}

#[cfg(test)]
mod tests {
   use std::collections::HashMap;

   use super::*;
   use crate::device::recognition;

   #[test]
   fn test_ad_structures_round_trip_through_name_parser() {
      let data = HashMap::from([(0x09u8, b"BT-Music".to_vec()), (0x01, vec![0x06])]);
      let payload = encode_ad_structures(&data);
      assert_eq!(&payload[..3], &[0x02, 0x01, 0x06]);
      assert_eq!(
         recognition::parse_advertised_name(&payload).as_deref(),
         Some("BT-Music")
      );
   }

   #[test]
   fn test_error_kinds_map_to_platform_codes() {
      let err = platform_error(bluer::Error {
         kind: ErrorKind::NotReady,
         message: "off".into(),
      });
      assert!(matches!(err, LinkError::TransportUnavailable(_)));

      let err = platform_error(bluer::Error {
         kind: ErrorKind::InProgress,
         message: "busy".into(),
      });
      assert!(err.is_busy());
   }
}
