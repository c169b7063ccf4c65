//! Connection state machine: the session type and the link establishment
//! pipeline.
//!
//! The pipeline functions run inside a cancellable task spawned by the
//! manager and report each state they enter through a progress callback; the
//! manager actor is the only place that mutates a [`ConnectionSession`].

use std::{collections::BTreeSet, time::Duration};

use futures::stream::BoxStream;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
   task::JoinSet,
   time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
   bluetooth::{
      liveness::HeartbeatMonitor,
      scanner::DeviceRecord,
      transport::{CharacteristicInfo, DeviceId, Endpoint, Packet, ServiceInfo, Transport},
   },
   config::LinkConfig,
   device::{
      protocol::{FrameDialect, HANDSHAKE_SEQUENCE, HandshakeProfile},
      recognition::COMMON_AUDIO_SERVICES,
   },
   error::{LinkError, Result},
   whitelist::validator::AuthorizationVerdict,
};

/// Service exposed by the supported accessories.
pub const TARGET_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Control characteristic within [`TARGET_SERVICE`].
pub const TARGET_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LinkState {
   Idle,
   Connecting,
   ServiceDiscovery,
   CharacteristicNegotiation,
   NotificationSetup,
   Handshaking,
   Ready,
   Reconnecting,
   Disconnected,
}

impl LinkState {
   pub const fn is_terminal(self) -> bool {
      matches!(self, Self::Disconnected)
   }

   /// States of an attempt still being established.
   pub const fn is_establishing(self) -> bool {
      matches!(
         self,
         Self::Connecting
            | Self::ServiceDiscovery
            | Self::CharacteristicNegotiation
            | Self::NotificationSetup
            | Self::Handshaking
      )
   }
}

/// Negotiated GATT layout of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkLayout {
   pub primary_service_id: Uuid,
   pub writable_characteristic_id: Option<Uuid>,
   pub notifiable_characteristic_id: Option<Uuid>,
   pub readable_characteristic_id: Option<Uuid>,
}

impl LinkLayout {
   fn endpoint(&self, characteristic: Option<Uuid>) -> Option<Endpoint> {
      characteristic.map(|characteristic| Endpoint {
         service: self.primary_service_id,
         characteristic,
      })
   }

   pub fn writer(&self) -> Option<Endpoint> {
      self.endpoint(self.writable_characteristic_id)
   }

   pub fn notifier(&self) -> Option<Endpoint> {
      self.endpoint(self.notifiable_characteristic_id)
   }

   /// Characteristic used for active liveness reads.
   pub fn reader(&self) -> Option<Endpoint> {
      self.endpoint(self.readable_characteristic_id)
   }
}

/// Selects the primary service: the target id, then common accessory audio
/// services, then anything the advertisement announced, then the first
/// primary service.
pub fn select_service(services: &[ServiceInfo], advertised: &BTreeSet<Uuid>) -> Option<Uuid> {
   let has = |id: &Uuid| services.iter().any(|s| &s.id == id);
   std::iter::once(&TARGET_SERVICE)
      .chain(COMMON_AUDIO_SERVICES.iter())
      .find(|id| has(id))
      .or_else(|| advertised.iter().find(|id| has(id)))
      .copied()
      .or_else(|| services.iter().find(|s| s.primary).map(|s| s.id))
      .or_else(|| services.first().map(|s| s.id))
}

/// Picks characteristic roles within the selected service. One
/// characteristic may serve several roles.
pub fn select_characteristics(service: Uuid, chars: &[CharacteristicInfo]) -> LinkLayout {
   let target = chars.iter().find(|c| c.id == TARGET_CHARACTERISTIC);
   let writer = target
      .filter(|c| c.writable())
      .or_else(|| chars.iter().find(|c| c.writable() && c.notifiable()))
      .or_else(|| chars.iter().find(|c| c.writable()));
   let notifier = target
      .filter(|c| c.notifiable())
      .or_else(|| chars.iter().find(|c| c.notifiable()));
   let reader = target
      .filter(|c| c.read)
      .or_else(|| chars.iter().find(|c| c.read));
   LinkLayout {
      primary_service_id: service,
      writable_characteristic_id: writer.map(|c| c.id),
      notifiable_characteristic_id: notifier.map(|c| c.id),
      readable_characteristic_id: reader.map(|c| c.id),
   }
}

/// Tears down any stale link, settles, then connects. Busy errors are retried
/// a few times before surfacing as [`LinkError::DeviceOccupied`].
pub async fn open_link(
   transport: &dyn Transport,
   config: &LinkConfig,
   device: &DeviceId,
   progress: &(dyn Fn(LinkState) + Sync),
) -> Result<()> {
   progress(LinkState::Connecting);
   if let Err(e) = transport.disconnect(device).await {
      debug!("Pre-connect teardown of {device}: {e}");
   }
   time::sleep(config.settle_delay()).await;

   let mut retries = 0;
   loop {
      match connect_once(transport, config, device).await {
         Ok(()) => return Ok(()),
         Err(e) if e.is_busy() && retries < config.busy_retries => {
            retries += 1;
            warn!(
               "{device} is busy ({e}), retry {retries}/{}",
               config.busy_retries
            );
            time::sleep(config.busy_retry_delay()).await;
            if let Err(e) = transport.disconnect(device).await {
               debug!("Teardown before retry of {device}: {e}");
            }
         },
         Err(e) if e.is_busy() => return Err(LinkError::DeviceOccupied),
         Err(e) => return Err(e),
      }
   }
}

/// One bounded transport connect.
pub async fn connect_once(transport: &dyn Transport, config: &LinkConfig, device: &DeviceId) -> Result<()> {
   time::timeout(config.connect_timeout(), transport.connect(device))
      .await
      .map_err(|_| LinkError::Timeout)?
}

/// Result of a successful negotiation.
pub struct Established {
   pub layout: LinkLayout,
   pub notifications: Option<BoxStream<'static, Packet>>,
}

/// Service discovery, characteristic negotiation, notification setup and
/// handshake on an open link.
pub async fn negotiate(
   transport: &dyn Transport,
   config: &LinkConfig,
   record: &DeviceRecord,
   profile: HandshakeProfile,
   progress: &(dyn Fn(LinkState) + Sync),
) -> Result<Established> {
   let device = &record.device_id;

   progress(LinkState::ServiceDiscovery);
   let services = time::timeout(config.connect_timeout(), transport.services(device))
      .await
      .map_err(|_| LinkError::DiscoveryTimeout)??;
   let service =
      select_service(&services, &record.advertised_service_ids).ok_or(LinkError::ServiceNotFound)?;
   debug!("{device}: using service {service} of {}", services.len());

   progress(LinkState::CharacteristicNegotiation);
   let chars = transport.characteristics(device, service).await?;
   if chars.is_empty() {
      return Err(LinkError::CharacteristicNotFound);
   }
   let layout = select_characteristics(service, &chars);
   if layout.writable_characteristic_id.is_none() && layout.notifiable_characteristic_id.is_none() {
      warn!("{device}: no writable or notifiable characteristic, link is read-only");
   }

   let mut notifications = None;
   if let Some(endpoint) = layout.notifier() {
      progress(LinkState::NotificationSetup);
      notifications = subscribe_with_retry(transport, config, device, endpoint).await;
   }

   if profile.performs_handshake() {
      progress(LinkState::Handshaking);
      handshake(transport, config, device, &layout).await;
   } else {
      debug!("{device}: {profile} firmware, skipping handshake");
   }

   Ok(Established {
      layout,
      notifications,
   })
}

async fn subscribe_with_retry(
   transport: &dyn Transport,
   config: &LinkConfig,
   device: &DeviceId,
   endpoint: Endpoint,
) -> Option<BoxStream<'static, Packet>> {
   let attempts = config.notification_retries.max(1);
   for attempt in 1..=attempts {
      match transport.subscribe(device, endpoint).await {
         Ok(stream) => return Some(stream),
         Err(e) => {
            warn!("{device}: notification setup failed ({attempt}/{attempts}): {e}");
            if attempt < attempts {
               time::sleep(config.notification_retry_delay()).await;
            }
         },
      }
   }
   warn!("{device}: continuing without notifications, relying on liveness polling");
   None
}

/// Sends every candidate handshake frame. Failures are logged only.
async fn handshake(transport: &dyn Transport, config: &LinkConfig, device: &DeviceId, layout: &LinkLayout) {
   let Some(writer) = layout.writer() else {
      debug!("{device}: no writable characteristic, skipping handshake");
      return;
   };
   for (i, frame) in HANDSHAKE_SEQUENCE.iter().enumerate() {
      if i > 0 {
         time::sleep(config.handshake_spacing()).await;
      }
      debug!("→ {device}: {}", hex::encode(frame));
      if let Err(e) = transport.write(device, writer, frame).await {
         debug!("{device}: handshake frame {i} failed: {e}, continuing anyway");
      }
   }
   info!("{device}: handshake sent");
}

/// The single logical connection owned by the manager.
pub struct ConnectionSession {
   pub generation: u64,
   pub record: DeviceRecord,
   pub state: LinkState,
   pub verdict: Option<AuthorizationVerdict>,
   pub profile: HandshakeProfile,
   pub dialect: FrameDialect,
   pub layout: Option<LinkLayout>,
   pub monitor: HeartbeatMonitor,
   pub reconnect_attempts: u32,
   pub tasks: JoinSet<()>,
   pub cancel: CancellationToken,
}

impl ConnectionSession {
   pub fn new(generation: u64, record: DeviceRecord, silence_threshold: Duration) -> Self {
      let profile = HandshakeProfile::for_device(&record.display_name);
      Self {
         generation,
         record,
         state: LinkState::Idle,
         verdict: None,
         profile,
         dialect: FrameDialect::default(),
         layout: None,
         monitor: HeartbeatMonitor::new(Instant::now(), silence_threshold),
         reconnect_attempts: 0,
         tasks: JoinSet::new(),
         cancel: CancellationToken::new(),
      }
   }

   pub fn device_id(&self) -> &DeviceId {
      &self.record.device_id
   }

   /// Cancels every timer, pump and in-flight attempt of this session.
   pub fn stop_tasks(&mut self) {
      self.cancel.cancel();
      self.tasks.abort_all();
      self.tasks.detach_all();
   }

   /// Fresh token for the next phase; the previous one is cancelled.
   pub fn renew_token(&mut self) -> CancellationToken {
      self.stop_tasks();
      self.cancel = CancellationToken::new();
      self.cancel.clone()
   }

   pub fn info(&self) -> SessionInfo {
      SessionInfo {
         device_id: self.record.device_id.clone(),
         display_name: self.record.display_name.to_string(),
         state: self.state,
         layout: self.layout,
         silent_secs: self.monitor.silent_for(Instant::now()).as_secs(),
         reconnect_attempts: self.reconnect_attempts,
         handshake_profile: self.profile,
         dialect: self.dialect,
         verdict: self.verdict,
         active_tasks: self.tasks.len(),
      }
   }
}

impl Drop for ConnectionSession {
   fn drop(&mut self) {
      self.stop_tasks();
   }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
   pub device_id: DeviceId,
   pub display_name: String,
   pub state: LinkState,
   pub layout: Option<LinkLayout>,
   pub silent_secs: u64,
   pub reconnect_attempts: u32,
   pub handshake_profile: HandshakeProfile,
   pub dialect: FrameDialect,
   pub verdict: Option<AuthorizationVerdict>,
   pub active_tasks: usize,
}
