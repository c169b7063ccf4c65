//! In-memory doubles for the transport and the allow-list service.

use std::{
   collections::{HashMap, VecDeque},
   sync::atomic::{AtomicBool, AtomicUsize, Ordering},
   time::Duration,
};

use async_trait::async_trait;
use futures::{
   StreamExt,
   channel::mpsc::{self, UnboundedSender},
   stream::BoxStream,
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::{
      scanner::DeviceRecord,
      session::{TARGET_CHARACTERISTIC, TARGET_SERVICE},
      transport::{
         Advertisement, CharacteristicInfo, DeviceId, Endpoint, Packet, ServiceInfo, Transport,
      },
   },
   device::recognition::{MacAddress, base_uuid},
   error::{LinkError, Result},
   event::{EventBus, LinkEvent},
   whitelist::client::{AllowListService, REASON_MAX_USERS, RemoteVerification, WhitelistEntry},
};

/// Full 128-bit form of a 16-bit SIG id.
pub fn audio_uuid(short: u32) -> Uuid {
   base_uuid(short)
}

/// `flags` is any of `r`, `w`, `n`.
pub fn characteristic(id: Uuid, flags: &str) -> CharacteristicInfo {
   CharacteristicInfo {
      id,
      read: flags.contains('r'),
      write: flags.contains('w'),
      notify: flags.contains('n'),
      ..CharacteristicInfo::default()
   }
}

/// Record of an accessory advertising the target service.
pub fn target_record(id: &str, name: &str) -> DeviceRecord {
   DeviceRecord::from_advertisement(DeviceId::new(id), &target_advertisement(id, name))
}

pub fn target_advertisement(id: &str, name: &str) -> Advertisement {
   Advertisement {
      device_id: Some(DeviceId::new(id)),
      address: MacAddress::parse("11:29:AA:25:4A:58"),
      name: Some(name.into()),
      rssi: Some(-50),
      service_ids: vec![TARGET_SERVICE],
      ..Advertisement::default()
   }
}

#[derive(Default)]
struct FakeLink {
   services: Vec<ServiceInfo>,
   characteristics: Vec<CharacteristicInfo>,
   discovered: Vec<Advertisement>,
   connected: Vec<Advertisement>,
   connect_failures: VecDeque<LinkError>,
   refuse_connects: bool,
   connect_delay: Duration,
   services_delay: Duration,
   subscribe_failures: usize,
   write_failures: usize,
   read_failures: usize,
   writes: Vec<Vec<u8>>,
   responders: Vec<(u8, Vec<u8>)>,
   scan_tx: Option<UnboundedSender<Advertisement>>,
   notify_tx: HashMap<DeviceId, UnboundedSender<Packet>>,
   link_tx: HashMap<DeviceId, UnboundedSender<bool>>,
}

/// Scriptable [`Transport`].
#[derive(Default)]
pub struct FakeTransport {
   state: Mutex<FakeLink>,
   connect_calls: AtomicUsize,
   disconnect_calls: AtomicUsize,
   subscribe_calls: AtomicUsize,
   read_calls: AtomicUsize,
}

impl FakeTransport {
   pub fn new() -> Self {
      Self::default()
   }

   /// Exposes the target service with a read/write/notify control
   /// characteristic.
   pub fn accessory() -> Self {
      let transport = Self::new();
      {
         let mut state = transport.state.lock();
         state.services = vec![ServiceInfo {
            id: TARGET_SERVICE,
            primary: true,
         }];
         state.characteristics = vec![characteristic(TARGET_CHARACTERISTIC, "rwn")];
      }
      transport
   }

   pub fn set_characteristics(&self, chars: Vec<CharacteristicInfo>) {
      self.state.lock().characteristics = chars;
   }

   pub fn add_discovered(&self, adv: Advertisement) {
      self.state.lock().discovered.push(adv);
   }

   /// Pushes an advertisement into the running scan.
   pub fn advertise(&self, adv: Advertisement) {
      if let Some(tx) = &self.state.lock().scan_tx {
         let _ = tx.unbounded_send(adv);
      }
   }

   pub fn set_connected(&self, devices: Vec<Advertisement>) {
      self.state.lock().connected = devices;
   }

   pub fn fail_connects(&self, errors: Vec<LinkError>) {
      self.state.lock().connect_failures.extend(errors);
   }

   /// Every further connect fails with a platform error.
   pub fn refuse_connects(&self, refuse: bool) {
      self.state.lock().refuse_connects = refuse;
   }

   pub fn set_connect_delay(&self, delay: Duration) {
      self.state.lock().connect_delay = delay;
   }

   /// Stalls GATT service discovery.
   pub fn set_services_delay(&self, delay: Duration) {
      self.state.lock().services_delay = delay;
   }

   pub fn fail_subscribes(&self, n: usize) {
      self.state.lock().subscribe_failures = n;
   }

   pub fn fail_writes(&self, n: usize) {
      self.state.lock().write_failures = n;
   }

   pub fn fail_reads(&self, n: usize) {
      self.state.lock().read_failures = n;
   }

   /// Answers every successful write starting with `first_byte` with a
   /// notification.
   pub fn respond_to(&self, first_byte: u8, reply: &[u8]) {
      self.state.lock().responders.push((first_byte, reply.to_vec()));
   }

   pub fn notify(&self, device: &DeviceId, bytes: &[u8]) {
      if let Some(tx) = self.state.lock().notify_tx.get(device) {
         let _ = tx.unbounded_send(Packet::from_slice(bytes));
      }
   }

   /// Reports the link as lost.
   pub fn drop_link(&self, device: &DeviceId) {
      if let Some(tx) = self.state.lock().link_tx.get(device) {
         let _ = tx.unbounded_send(false);
      }
   }

   pub fn writes(&self) -> Vec<Vec<u8>> {
      self.state.lock().writes.clone()
   }

   pub fn connect_calls(&self) -> usize {
      self.connect_calls.load(Ordering::SeqCst)
   }

   pub fn disconnect_calls(&self) -> usize {
      self.disconnect_calls.load(Ordering::SeqCst)
   }

   pub fn subscribe_calls(&self) -> usize {
      self.subscribe_calls.load(Ordering::SeqCst)
   }

   pub fn read_calls(&self) -> usize {
      self.read_calls.load(Ordering::SeqCst)
   }
}

#[async_trait]
impl Transport for FakeTransport {
   async fn start_scan(&self) -> Result<BoxStream<'static, Advertisement>> {
      let (tx, rx) = mpsc::unbounded();
      self.state.lock().scan_tx = Some(tx);
      Ok(rx.boxed())
   }

   async fn stop_scan(&self) -> Result<()> {
      self.state.lock().scan_tx = None;
      Ok(())
   }

   async fn discovered_devices(&self) -> Result<Vec<Advertisement>> {
      Ok(self.state.lock().discovered.clone())
   }

   async fn connect(&self, _device: &DeviceId) -> Result<()> {
      self.connect_calls.fetch_add(1, Ordering::SeqCst);
      let delay = self.state.lock().connect_delay;
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      let mut state = self.state.lock();
      if let Some(e) = state.connect_failures.pop_front() {
         return Err(e);
      }
      if state.refuse_connects {
         return Err(LinkError::platform(10003, "refused"));
      }
      Ok(())
   }

   async fn disconnect(&self, device: &DeviceId) -> Result<()> {
      self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
      let mut state = self.state.lock();
      state.notify_tx.remove(device);
      state.link_tx.remove(device);
      Ok(())
   }

   async fn services(&self, _device: &DeviceId) -> Result<Vec<ServiceInfo>> {
      let delay = self.state.lock().services_delay;
      if !delay.is_zero() {
         tokio::time::sleep(delay).await;
      }
      Ok(self.state.lock().services.clone())
   }

   async fn characteristics(&self, _device: &DeviceId, service: Uuid) -> Result<Vec<CharacteristicInfo>> {
      let state = self.state.lock();
      if state.services.iter().any(|s| s.id == service) {
         Ok(state.characteristics.clone())
      } else {
         Ok(Vec::new())
      }
   }

   async fn write(&self, device: &DeviceId, _endpoint: Endpoint, data: &[u8]) -> Result<()> {
      let mut state = self.state.lock();
      if state.write_failures > 0 {
         state.write_failures -= 1;
         return Err(LinkError::platform(10008, "write failed"));
      }
      state.writes.push(data.to_vec());
      let reply = state
         .responders
         .iter()
         .find(|(first, _)| data.first() == Some(first))
         .map(|(_, reply)| reply.clone());
      if let Some(reply) = reply
         && let Some(tx) = state.notify_tx.get(device)
      {
         let _ = tx.unbounded_send(Packet::from_slice(&reply));
      }
      Ok(())
   }

   async fn read(&self, _device: &DeviceId, _endpoint: Endpoint) -> Result<Packet> {
      self.read_calls.fetch_add(1, Ordering::SeqCst);
      let mut state = self.state.lock();
      if state.read_failures > 0 {
         state.read_failures -= 1;
         return Err(LinkError::platform(10006, "read failed"));
      }
      Ok(Packet::from_slice(&[0xAA, 0x01, 0x00, 0x00, 0xAB]))
   }

   async fn subscribe(&self, device: &DeviceId, _endpoint: Endpoint) -> Result<BoxStream<'static, Packet>> {
      self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
      let mut state = self.state.lock();
      if state.subscribe_failures > 0 {
         state.subscribe_failures -= 1;
         return Err(LinkError::platform(10005, "no notify"));
      }
      let (tx, rx) = mpsc::unbounded();
      state.notify_tx.insert(device.clone(), tx);
      Ok(rx.boxed())
   }

   async fn connected_devices(&self) -> Result<Vec<Advertisement>> {
      Ok(self.state.lock().connected.clone())
   }

   async fn connection_events(&self, device: &DeviceId) -> Result<BoxStream<'static, bool>> {
      let (tx, rx) = mpsc::unbounded();
      self.state.lock().link_tx.insert(device.clone(), tx);
      Ok(rx.boxed())
   }
}

/// In-memory allow-list service.
#[derive(Default)]
pub struct FakeAllowList {
   entries: Mutex<Vec<WhitelistEntry>>,
   unreachable: bool,
   verify_fails: AtomicBool,
   bind_fails: AtomicBool,
   whitelist_calls: AtomicUsize,
   verify_calls: AtomicUsize,
   bind_calls: AtomicUsize,
}

impl FakeAllowList {
   pub fn new(entries: Vec<WhitelistEntry>) -> Self {
      Self {
         entries: Mutex::new(entries),
         ..Self::default()
      }
   }

   /// Every call times out.
   pub fn unreachable() -> Self {
      Self {
         unreachable: true,
         ..Self::default()
      }
   }

   pub fn fail_verify(&self, fail: bool) {
      self.verify_fails.store(fail, Ordering::SeqCst);
   }

   /// Affects bind and unbind.
   pub fn fail_bind(&self, fail: bool) {
      self.bind_fails.store(fail, Ordering::SeqCst);
   }

   pub fn whitelist_calls(&self) -> usize {
      self.whitelist_calls.load(Ordering::SeqCst)
   }

   pub fn verify_calls(&self) -> usize {
      self.verify_calls.load(Ordering::SeqCst)
   }

   pub fn bind_calls(&self) -> usize {
      self.bind_calls.load(Ordering::SeqCst)
   }

   fn find(&self, mac: &MacAddress) -> Option<WhitelistEntry> {
      self
         .entries
         .lock()
         .iter()
         .find(|e| e.mac().as_ref() == Some(mac))
         .cloned()
   }
}

#[async_trait]
impl AllowListService for FakeAllowList {
   async fn whitelist(&self) -> Result<Vec<WhitelistEntry>> {
      self.whitelist_calls.fetch_add(1, Ordering::SeqCst);
      if self.unreachable {
         return Err(LinkError::Timeout);
      }
      Ok(self.entries.lock().clone())
   }

   async fn verify(&self, mac: &MacAddress, _name: &str) -> Result<RemoteVerification> {
      self.verify_calls.fetch_add(1, Ordering::SeqCst);
      if self.unreachable || self.verify_fails.load(Ordering::SeqCst) {
         return Err(LinkError::Timeout);
      }
      let entry = self.find(mac).filter(|e| e.is_active);
      Ok(RemoteVerification {
         is_whitelisted: entry.is_some(),
         can_bind: entry.as_ref().is_some_and(WhitelistEntry::has_quota),
         reason: match &entry {
            None => Some(SmolStr::new_static("not_in_whitelist")),
            Some(e) if !e.has_quota() => Some(SmolStr::new_static(REASON_MAX_USERS)),
            Some(_) => None,
         },
         device_info: entry,
      })
   }

   async fn bind(&self, mac: &MacAddress, _name: &str) -> Result<()> {
      self.bind_calls.fetch_add(1, Ordering::SeqCst);
      if self.unreachable || self.bind_fails.load(Ordering::SeqCst) {
         return Err(LinkError::AuthorizationServiceUnavailable("bind rejected".into()));
      }
      if let Some(entry) = self
         .entries
         .lock()
         .iter_mut()
         .find(|e| e.mac().as_ref() == Some(mac))
      {
         entry.current_bindings += 1;
      }
      Ok(())
   }

   async fn unbind(&self, mac: &MacAddress) -> Result<()> {
      if self.unreachable || self.bind_fails.load(Ordering::SeqCst) {
         return Err(LinkError::AuthorizationServiceUnavailable("unbind rejected".into()));
      }
      if let Some(entry) = self
         .entries
         .lock()
         .iter_mut()
         .find(|e| e.mac().as_ref() == Some(mac))
      {
         entry.current_bindings = entry.current_bindings.saturating_sub(1);
      }
      Ok(())
   }

   async fn my_devices(&self) -> Result<Vec<WhitelistEntry>> {
      Ok(self.entries.lock().clone())
   }
}

/// Collects emitted events.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<(DeviceId, LinkEvent)>>,
}

impl RecordingBus {
   pub fn events(&self) -> Vec<LinkEvent> {
      self.events.lock().iter().map(|(_, e)| e.clone()).collect()
   }

   pub fn count(&self, pred: impl Fn(&LinkEvent) -> bool) -> usize {
      self.events.lock().iter().filter(|(_, e)| pred(e)).count()
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, device: &DeviceId, event: LinkEvent) {
      self.events.lock().push((device.clone(), event));
   }
}
