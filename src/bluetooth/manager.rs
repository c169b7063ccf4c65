//! Link manager.
//!
//! A single actor owns the scanner, the active [`ConnectionSession`] and the
//! exclusive access guard. Background work (connection attempts, notification
//! pumps, timers) runs in tasks owned by the session and only talks back
//! through the loopback channel, tagging every message with the session
//! generation. Messages from a superseded session are dropped on arrival.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
   select,
   sync::{broadcast, mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   bluetooth::{
      guard::{CaptureRecord, ExclusiveAccessGuard, find_foreign_captures},
      liveness::{HeartbeatAction, spawn_ticker},
      reconnect::ReconnectionPolicy,
      scanner::{DeviceRecord, ScanFilter, Scanner},
      session::{
         ConnectionSession, Established, LinkState, SessionInfo, connect_once, negotiate, open_link,
      },
      transport::{DeviceId, Packet, Transport},
   },
   config::{Config, LinkConfig},
   device::protocol::{
      self, Command, FrameDialect, HandshakeProfile, Opcode, StatusUpdate, TelemetryEvent,
   },
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
   whitelist::{
      store::WhitelistStore,
      validator::{AuthorizationValidator, AuthorizationVerdict},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Telemetry fan-out buffer
const TELEMETRY_BUFFER_SIZE: usize = 64;
/// Attempts per command write
const WRITE_ATTEMPTS: u32 = 3;
/// Delay between command write attempts
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

// === Commands ===

enum ManagerCommand {
   // User commands
   StartScan(ScanFilter, oneshot::Sender<Result<()>>),
   StopScan(oneshot::Sender<()>),
   GetDevices(oneshot::Sender<Vec<DeviceRecord>>),
   Connect(DeviceId, Option<oneshot::Sender<Result<SessionInfo>>>),
   Disconnect(oneshot::Sender<Result<()>>),
   GetSession(oneshot::Sender<Option<SessionInfo>>),
   SendCommand(Command, Option<FrameDialect>, oneshot::Sender<Result<()>>),
   Passthrough(Packet, oneshot::Sender<Result<()>>),
   SetDialect(FrameDialect),
   SetExclusiveMode(bool),
   RecentCaptures(oneshot::Sender<Vec<CaptureRecord>>),

   // Loopback, tagged with the session generation
   Sighted(DeviceRecord),
   Authorized(u64, AuthorizationVerdict),
   Progress(u64, LinkState),
   AttemptFinished(u64, Result<Established>),
   ReconnectFinished(u64, Result<Established>),
   LinkDropped(u64),
   DataReceived(u64, Packet),
   HeartbeatTick(u64),
   LivenessTick(u64),
   GuardTick(u64),
   ForeignCaptures(u64, Vec<CaptureRecord>),
}

/// Answer of a status probe.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusReport {
   /// Dialect the device answered in, now used for the session.
   pub dialect: FrameDialect,
   pub telemetry: TelemetryEvent,
   pub status: Option<StatusUpdate>,
}

// === Main Manager ===

/// Handle to the link manager actor.
#[derive(Clone)]
pub struct LinkManager {
   inbox: mpsc::Sender<ManagerCommand>,
   telemetry: broadcast::Sender<TelemetryEvent>,
   response_timeout: Duration,
}

impl LinkManager {
   pub fn new(
      event_tx: EventSender,
      config: Config,
      transport: Arc<dyn Transport>,
      validator: Arc<AuthorizationValidator>,
      store: Option<WhitelistStore>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (telemetry, _) = broadcast::channel(TELEMETRY_BUFFER_SIZE);
      let response_timeout = config.link.dialect_response_timeout();
      let actor = ManagerActor::new(
         config,
         event_tx,
         transport,
         validator,
         store,
         telemetry.clone(),
         command_rx,
      );
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         telemetry,
         response_timeout,
      }
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)
   }

   /// Starts a fresh scan; the previous candidate list is discarded.
   pub async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
      self.request(|tx| ManagerCommand::StartScan(filter, tx)).await?
   }

   pub async fn stop_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StopScan).await
   }

   /// Candidates of the last scan, preferred and strongest first.
   pub async fn devices(&self) -> Vec<DeviceRecord> {
      self
         .request(ManagerCommand::GetDevices)
         .await
         .unwrap_or_default()
   }

   /// Authorizes and connects to a scanned device. Resolves once the session
   /// is ready or the attempt failed. Any existing session is torn down first.
   pub async fn connect(&self, device: DeviceId) -> Result<SessionInfo> {
      self
         .request(|tx| ManagerCommand::Connect(device, Some(tx)))
         .await?
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.request(ManagerCommand::Disconnect).await?
   }

   /// The active session, or the final state of the last one.
   pub async fn session(&self) -> Option<SessionInfo> {
      self.request(ManagerCommand::GetSession).await.ok().flatten()
   }

   /// Encodes the command in the session dialect and writes it.
   pub async fn send(&self, command: Command) -> Result<()> {
      self
         .request(|tx| ManagerCommand::SendCommand(command, None, tx))
         .await?
   }

   /// Writes raw bytes as-is.
   pub async fn passthrough(&self, bytes: &[u8]) -> Result<()> {
      let packet = Packet::from_slice(bytes);
      self
         .request(|tx| ManagerCommand::Passthrough(packet, tx))
         .await?
   }

   /// Decoded inbound frames of the active session.
   pub fn telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
      self.telemetry.subscribe()
   }

   /// Queries the device status, probing each framing dialect in turn
   /// (current one first) until the device answers. The answering dialect is
   /// adopted for the session.
   pub async fn request_status(&self) -> Result<StatusReport> {
      let current = self.session().await.ok_or(LinkError::NotConnected)?.dialect;
      let order = std::iter::once(current).chain(
         FrameDialect::PROBE_ORDER
            .into_iter()
            .filter(move |d| *d != current),
      );
      for dialect in order {
         let mut telemetry = self.telemetry.subscribe();
         self
            .request(|tx| ManagerCommand::SendCommand(Command::QueryStatus, Some(dialect), tx))
            .await??;
         let answer = time::timeout(self.response_timeout, next_status(&mut telemetry, dialect));
         let Ok(Some(event)) = answer.await else {
            debug!("No status answer in {dialect} dialect");
            continue;
         };
         if dialect != current {
            info!("Device answers in {dialect} dialect, switching");
            self
               .inbox
               .send(ManagerCommand::SetDialect(dialect))
               .await
               .map_err(|_| LinkError::ManagerShutdown)?;
         }
         return Ok(StatusReport {
            dialect,
            telemetry: event,
            status: StatusUpdate::from_telemetry(&event),
         });
      }
      Err(LinkError::Timeout)
   }

   pub async fn set_exclusive_mode(&self, enabled: bool) -> Result<()> {
      self
         .inbox
         .send(ManagerCommand::SetExclusiveMode(enabled))
         .await
         .map_err(|_| LinkError::ManagerShutdown)
   }

   /// Recent foreign-capture occurrences, oldest first.
   pub async fn recent_captures(&self) -> Vec<CaptureRecord> {
      self
         .request(ManagerCommand::RecentCaptures)
         .await
         .unwrap_or_default()
   }
}

/// Waits for a complete status frame in `dialect`. Anything else on the link
/// (late answers to an earlier dialect, unrelated notifications) is skipped.
async fn next_status(
   rx: &mut broadcast::Receiver<TelemetryEvent>,
   dialect: FrameDialect,
) -> Option<TelemetryEvent> {
   loop {
      match rx.recv().await {
         Ok(event)
            if event.dialect == dialect
               && event.complete
               && event.known_opcode() == Some(Opcode::Status) =>
         {
            return Some(event);
         },
         Ok(event) => debug!("Skipping {} frame {:#04x} while probing", event.dialect, event.opcode),
         Err(broadcast::error::RecvError::Lagged(n)) => debug!("Telemetry receiver lagged by {n}"),
         Err(broadcast::error::RecvError::Closed) => return None,
      }
   }
}

// === Attempt pipelines ===

/// Authorization, link setup and negotiation of a fresh connection.
async fn establish(
   transport: &dyn Transport,
   validator: &AuthorizationValidator,
   config: &LinkConfig,
   record: &DeviceRecord,
   profile: HandshakeProfile,
   generation: u64,
   loopback: &mpsc::Sender<ManagerCommand>,
   progress: &(dyn Fn(LinkState) + Sync),
) -> Result<Established> {
   let verdict = validator
      .verify(record.mac_address.as_ref(), &record.display_name)
      .await;
   let _ = loopback
      .send(ManagerCommand::Authorized(generation, verdict))
      .await;
   if !verdict.is_allowed() {
      return Err(LinkError::AuthorizationDenied(verdict.reason()));
   }
   open_link(transport, config, &record.device_id, progress).await?;
   negotiate(transport, config, record, profile, progress).await
}

/// One delayed reconnect attempt with full renegotiation.
async fn reconnect_once(
   transport: &dyn Transport,
   config: &LinkConfig,
   record: &DeviceRecord,
   profile: HandshakeProfile,
   delay: Duration,
   progress: &(dyn Fn(LinkState) + Sync),
) -> Result<Established> {
   time::sleep(delay).await;
   connect_once(transport, config, &record.device_id).await?;
   negotiate(transport, config, record, profile, progress).await
}

fn progress_reporter(
   loopback: mpsc::Sender<ManagerCommand>,
   generation: u64,
) -> impl Fn(LinkState) + Send + Sync + 'static {
   move |state| {
      if let Err(e) = loopback.try_send(ManagerCommand::Progress(generation, state)) {
         debug!("Dropped progress update: {e}");
      }
   }
}

fn transition(event_tx: &EventSender, session: &mut ConnectionSession, state: LinkState) {
   if session.state == state {
      return;
   }
   info!("{}: {} → {}", session.device_id(), session.state, state);
   session.state = state;
   event_tx.emit(session.device_id(), LinkEvent::StateChanged(state));
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   transport: Arc<dyn Transport>,
   validator: Arc<AuthorizationValidator>,
   store: Option<WhitelistStore>,
   telemetry: broadcast::Sender<TelemetryEvent>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   policy: ReconnectionPolicy,

   // State
   scanner: Scanner,
   scan_forwarder: Option<JoinHandle<()>>,
   candidates: HashMap<DeviceId, DeviceRecord>,
   generation: u64,
   session: Option<ConnectionSession>,
   last_session: Option<SessionInfo>,
   pending_connect: Option<(u64, oneshot::Sender<Result<SessionInfo>>)>,
   guard: ExclusiveAccessGuard,
   guard_busy: bool,
   exclusive_mode: bool,
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      transport: Arc<dyn Transport>,
      validator: Arc<AuthorizationValidator>,
      store: Option<WhitelistStore>,
      telemetry: broadcast::Sender<TelemetryEvent>,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let history = store.as_ref().map_or_else(Vec::new, |s| {
         s.load_captures().unwrap_or_else(|e| {
            warn!("Failed to load capture log: {e}");
            Vec::new()
         })
      });
      Self {
         scanner: Scanner::new(transport.clone(), config.link.scan_poll()),
         policy: ReconnectionPolicy::from_config(&config.link),
         exclusive_mode: config.link.exclusive_mode,
         config,
         event_tx,
         transport,
         validator,
         store,
         telemetry,
         command_rx,
         loopback_rx,
         loopback_tx,
         scan_forwarder: None,
         candidates: HashMap::new(),
         generation: 0,
         session: None,
         last_session: None,
         pending_connect: None,
         guard: ExclusiveAccessGuard::with_history(history),
         guard_busy: false,
      }
   }

   async fn run(mut self) {
      info!("Link manager starting up");

      if self.config.link.auto_connect && !self.config.known_devices.is_empty() {
         info!(
            "Scanning for {} known device(s) to auto-connect",
            self.config.known_devices.len()
         );
         if let Err(e) = self.start_scan(ScanFilter::default()).await {
            warn!("Auto-connect scan failed to start: {e}");
         }
      }

      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Link manager shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            },
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            },
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::StartScan(filter, reply) => {
            let result = self.start_scan(filter).await;
            let _ = reply.send(result);
         },
         ManagerCommand::StopScan(reply) => {
            self.stop_scan().await;
            let _ = reply.send(());
         },
         ManagerCommand::GetDevices(reply) => {
            let mut devices: Vec<DeviceRecord> = self.candidates.values().cloned().collect();
            devices.sort_by(|a, b| {
               b.preferred
                  .cmp(&a.preferred)
                  .then(b.signal_strength.cmp(&a.signal_strength))
            });
            let _ = reply.send(devices);
         },
         ManagerCommand::Connect(device, reply) => {
            self.connect(device, reply).await;
         },
         ManagerCommand::Disconnect(reply) => {
            self.teardown(LinkError::Cancelled, "Disconnected").await;
            let _ = reply.send(Ok(()));
         },
         ManagerCommand::GetSession(reply) => {
            let info = self
               .session
               .as_ref()
               .map(ConnectionSession::info)
               .or_else(|| self.last_session.clone());
            let _ = reply.send(info);
         },
         ManagerCommand::SendCommand(command, dialect, reply) => {
            let result = match &self.session {
               Some(session) => {
                  let frame = command.encode(dialect.unwrap_or(session.dialect));
                  self.write_frame(&frame).await
               },
               None => Err(LinkError::NotConnected),
            };
            let _ = reply.send(result);
         },
         ManagerCommand::Passthrough(packet, reply) => {
            let _ = reply.send(self.write_frame(&packet).await);
         },
         ManagerCommand::SetDialect(dialect) => {
            if let Some(session) = &mut self.session {
               info!("{}: using {dialect} dialect", session.device_id());
               session.dialect = dialect;
            }
         },
         ManagerCommand::SetExclusiveMode(enabled) => {
            info!("Exclusive mode {}", if enabled { "enabled" } else { "disabled" });
            self.exclusive_mode = enabled;
         },
         ManagerCommand::RecentCaptures(reply) => {
            let _ = reply.send(self.guard.recent());
         },
         ManagerCommand::Sighted(record) => {
            self.handle_sighted(record).await;
         },
         ManagerCommand::Authorized(generation, verdict) => {
            if let Some(session) = self.current(generation) {
               session.verdict = Some(verdict);
            }
         },
         ManagerCommand::Progress(generation, state) => {
            if let Some(session) = self.session.as_mut().filter(|s| s.generation == generation)
               && !session.state.is_terminal()
               && session.state != LinkState::Ready
            {
               transition(&self.event_tx, session, state);
            }
         },
         ManagerCommand::AttemptFinished(generation, result) => {
            self.handle_attempt_finished(generation, result).await;
         },
         ManagerCommand::ReconnectFinished(generation, result) => {
            self.handle_reconnect_finished(generation, result).await;
         },
         ManagerCommand::LinkDropped(generation) => {
            if self.is_ready(generation) {
               self.handle_link_lost(LinkError::UnexpectedDisconnect).await;
            }
         },
         ManagerCommand::DataReceived(generation, packet) => {
            self.handle_data(generation, &packet);
         },
         ManagerCommand::HeartbeatTick(generation) => {
            self.heartbeat(generation).await;
         },
         ManagerCommand::LivenessTick(generation) => {
            self.check_liveness(generation).await;
         },
         ManagerCommand::GuardTick(generation) => {
            self.poll_guard(generation);
         },
         ManagerCommand::ForeignCaptures(generation, captures) => {
            self.handle_captures(generation, captures);
         },
      }
   }

   fn current(&mut self, generation: u64) -> Option<&mut ConnectionSession> {
      self.session.as_mut().filter(|s| s.generation == generation)
   }

   fn is_ready(&self, generation: u64) -> bool {
      self
         .session
         .as_ref()
         .is_some_and(|s| s.generation == generation && s.state == LinkState::Ready)
   }

   // === Scanning ===

   async fn start_scan(&mut self, filter: ScanFilter) -> Result<()> {
      self.candidates.clear();
      let mut records = self.scanner.start(filter).await?;
      let loopback = self.loopback_tx.clone();
      let forwarder = tokio::spawn(async move {
         while let Some(record) = records.recv().await {
            if loopback.send(ManagerCommand::Sighted(record)).await.is_err() {
               break;
            }
         }
      });
      if let Some(previous) = self.scan_forwarder.replace(forwarder) {
         previous.abort();
      }
      Ok(())
   }

   async fn stop_scan(&mut self) {
      self.scanner.stop().await;
      self.scan_forwarder = None;
   }

   async fn handle_sighted(&mut self, record: DeviceRecord) {
      let id = record.device_id.clone();
      self.event_tx.emit(&id, LinkEvent::DeviceFound(record.clone()));

      let known = record
         .mac_address
         .and_then(|mac| self.config.is_known_device(&mac.to_string()).map(str::to_owned));
      self.candidates.insert(id.clone(), record);

      if self.config.link.auto_connect
         && self.session.is_none()
         && let Some(name) = known
      {
         info!("Known device {name} ({id}) sighted, connecting");
         self.connect(id, None).await;
      }
   }

   // === Connection lifecycle ===

   async fn connect(&mut self, id: DeviceId, reply: Option<oneshot::Sender<Result<SessionInfo>>>) {
      let Some(record) = self.candidates.get(&id).cloned() else {
         warn!("Connect requested for unknown device {id}");
         if let Some(reply) = reply {
            let _ = reply.send(Err(LinkError::DeviceNotFound(id.0)));
         }
         return;
      };

      if self.scanner.is_scanning() {
         self.stop_scan().await;
      }
      if let Some(previous) = &self.session
         && previous.state.is_establishing()
      {
         info!("Superseding in-flight attempt with {}", previous.device_id());
      }
      self.teardown(LinkError::Superseded, "Replaced by a new connection").await;
      self.guard.reset_prompts();

      self.generation += 1;
      let generation = self.generation;
      let mut session =
         ConnectionSession::new(generation, record.clone(), self.config.link.silence_threshold());
      info!(
         "Connecting to {:?} ({id}), generation {generation}, {} profile",
         record.display_name, session.profile
      );

      let transport = self.transport.clone();
      let validator = self.validator.clone();
      let config = self.config.link.clone();
      let loopback = self.loopback_tx.clone();
      let cancel = session.cancel.clone();
      let profile = session.profile;
      session.tasks.spawn(async move {
         let progress = progress_reporter(loopback.clone(), generation);
         let result = select! {
            () = cancel.cancelled() => return,
            result = establish(
               &*transport,
               &validator,
               &config,
               &record,
               profile,
               generation,
               &loopback,
               &progress,
            ) => result,
         };
         let _ = loopback
            .send(ManagerCommand::AttemptFinished(generation, result))
            .await;
      });

      self.session = Some(session);
      self.pending_connect = reply.map(|reply| (generation, reply));
   }

   async fn handle_attempt_finished(&mut self, generation: u64, result: Result<Established>) {
      if self.current(generation).is_none() {
         debug!("Dropping result of superseded attempt {generation}");
         return;
      }
      let reply = self
         .pending_connect
         .take_if(|(g, _)| *g == generation)
         .map(|(_, reply)| reply);

      match result {
         Ok(established) => {
            self.go_ready(established).await;
            let Some(session) = self.session.as_ref() else {
               return;
            };
            if let Some(verdict) = session.verdict
               && verdict.can_bind()
               && let Some(mac) = session.record.mac_address
            {
               let validator = self.validator.clone();
               let name = session.record.display_name.clone();
               tokio::spawn(async move { validator.bind(&mac, &name).await });
            }
            if let Some(reply) = reply {
               let _ = reply.send(Ok(session.info()));
            }
         },
         Err(e) => {
            let Some(session) = self.session.as_ref() else {
               return;
            };
            let device = session.device_id().clone();
            warn!("Connection to {device} failed: {e}");
            self.event_tx.emit(
               &device,
               LinkEvent::ConnectFailed {
                  message: e.user_message().into_owned(),
               },
            );
            if !matches!(e, LinkError::AuthorizationDenied(_))
               && let Err(e) = self.transport.disconnect(&device).await
            {
               debug!("Cleanup disconnect of {device}: {e}");
            }
            self.finish_session();
            if let Some(reply) = reply {
               let _ = reply.send(Err(e));
            }
         },
      }
   }

   /// Starts the pumps and timers of a negotiated link and enters `Ready`.
   async fn go_ready(&mut self, established: Established) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      let generation = session.generation;
      let device = session.device_id().clone();
      let cancel = session.renew_token();
      session.layout = Some(established.layout);
      session.monitor.touch(Instant::now());
      self.guard_busy = false;

      if let Some(mut notifications) = established.notifications {
         let loopback = self.loopback_tx.clone();
         let cancel = cancel.clone();
         let device = device.clone();
         session.tasks.spawn(async move {
            loop {
               select! {
                  () = cancel.cancelled() => break,
                  packet = notifications.next() => {
                     let Some(packet) = packet else {
                        debug!("{device}: notification stream ended");
                        break;
                     };
                     if loopback
                        .send(ManagerCommand::DataReceived(generation, packet))
                        .await
                        .is_err()
                     {
                        break;
                     }
                  },
               }
            }
         });
      }

      match self.transport.connection_events(&device).await {
         Ok(mut events) => {
            let loopback = self.loopback_tx.clone();
            let cancel = cancel.clone();
            session.tasks.spawn(async move {
               loop {
                  select! {
                     () = cancel.cancelled() => break,
                     event = events.next() => match event {
                        Some(true) => {},
                        Some(false) => {
                           let _ = loopback.send(ManagerCommand::LinkDropped(generation)).await;
                           break;
                        },
                        None => break,
                     },
                  }
               }
            });
         },
         Err(e) => warn!("{device}: no connection events ({e}), relying on liveness checks"),
      }

      let link = &self.config.link;
      spawn_ticker(
         &mut session.tasks,
         cancel.clone(),
         link.heartbeat_interval(),
         self.loopback_tx.clone(),
         move || ManagerCommand::HeartbeatTick(generation),
      );
      spawn_ticker(
         &mut session.tasks,
         cancel.clone(),
         link.liveness_interval(),
         self.loopback_tx.clone(),
         move || ManagerCommand::LivenessTick(generation),
      );
      spawn_ticker(
         &mut session.tasks,
         cancel,
         link.exclusive_poll(),
         self.loopback_tx.clone(),
         move || ManagerCommand::GuardTick(generation),
      );

      transition(&self.event_tx, session, LinkState::Ready);
      self.event_tx.emit(&device, LinkEvent::Connected);
   }

   async fn handle_link_lost(&mut self, cause: LinkError) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      let device = session.device_id().clone();
      warn!("{device}: {cause}");

      if !self.config.link.auto_reconnect || !session.profile.reconnects() {
         let message = format!("{}: {}", session.record.display_name, cause.user_message());
         session.stop_tasks();
         self.event_tx.emit(&device, LinkEvent::Disconnected { message });
         if let Err(e) = self.transport.disconnect(&device).await {
            debug!("Cleanup disconnect of {device}: {e}");
         }
         self.finish_session();
         return;
      }

      session.renew_token();
      transition(&self.event_tx, session, LinkState::Reconnecting);
      // the platform may still hold a half-dead link
      if let Err(e) = self.transport.disconnect(&device).await {
         debug!("Teardown of stale link to {device}: {e}");
      }
      self.schedule_reconnect();
   }

   fn schedule_reconnect(&mut self) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      let device = session.device_id().clone();
      let attempt = session.reconnect_attempts + 1;
      let Some(delay) = self.policy.delay_for(attempt) else {
         let e = LinkError::ReconnectExhausted {
            attempts: session.reconnect_attempts,
         };
         error!("{device}: {e}");
         self.event_tx.emit(
            &device,
            LinkEvent::Disconnected {
               message: e.user_message().into_owned(),
            },
         );
         self.finish_session();
         return;
      };
      session.reconnect_attempts = attempt;
      info!(
         "{device}: reconnect attempt {attempt}/{} in {delay:?}",
         self.policy.max_attempts
      );

      let generation = session.generation;
      let transport = self.transport.clone();
      let config = self.config.link.clone();
      let record = session.record.clone();
      let profile = session.profile;
      let loopback = self.loopback_tx.clone();
      let cancel = session.cancel.clone();
      session.tasks.spawn(async move {
         let progress = progress_reporter(loopback.clone(), generation);
         let result = select! {
            () = cancel.cancelled() => return,
            result = reconnect_once(&*transport, &config, &record, profile, delay, &progress) => result,
         };
         let _ = loopback
            .send(ManagerCommand::ReconnectFinished(generation, result))
            .await;
      });
   }

   async fn handle_reconnect_finished(&mut self, generation: u64, result: Result<Established>) {
      let Some(session) = self.session.as_mut().filter(|s| s.generation == generation) else {
         return;
      };
      match result {
         Ok(established) => {
            info!(
               "{}: reconnected after {} attempt(s)",
               session.device_id(),
               session.reconnect_attempts
            );
            session.reconnect_attempts = 0;
            self.go_ready(established).await;
         },
         Err(e) => {
            warn!(
               "{}: reconnect attempt {} failed: {e}",
               session.device_id(),
               session.reconnect_attempts
            );
            transition(&self.event_tx, session, LinkState::Reconnecting);
            self.schedule_reconnect();
         },
      }
   }

   /// Explicitly tears down the session, awaiting the transport disconnect.
   /// A pending connect request is answered with `reason`.
   async fn teardown(&mut self, reason: LinkError, message: &str) {
      if let Some((_, reply)) = self.pending_connect.take() {
         let _ = reply.send(Err(reason));
      }
      let Some(session) = self.session.as_mut() else {
         return;
      };
      session.stop_tasks();
      let device = session.device_id().clone();
      info!("Tearing down session with {device}");
      if let Err(e) = self.transport.disconnect(&device).await {
         warn!("Failed to disconnect {device}: {e}");
      }
      self.event_tx.emit(
         &device,
         LinkEvent::Disconnected {
            message: message.to_owned(),
         },
      );
      self.finish_session();
   }

   /// Moves the session to its terminal state and keeps a snapshot of it.
   fn finish_session(&mut self) {
      let Some(mut session) = self.session.take() else {
         return;
      };
      session.stop_tasks();
      transition(&self.event_tx, &mut session, LinkState::Disconnected);
      self.last_session = Some(session.info());
      self.guard_busy = false;
   }

   // === Data path ===

   async fn write_frame(&self, frame: &[u8]) -> Result<()> {
      let Some(session) = self
         .session
         .as_ref()
         .filter(|s| s.state == LinkState::Ready)
      else {
         return Err(LinkError::NotConnected);
      };
      let writer = session
         .layout
         .and_then(|l| l.writer())
         .ok_or(LinkError::NotWritable)?;
      let device = session.device_id();

      let mut attempt = 1;
      loop {
         debug!("→ {device}: {}", hex::encode(frame));
         match self.transport.write(device, writer, frame).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_ATTEMPTS => {
               warn!("{device}: write failed ({attempt}/{WRITE_ATTEMPTS}): {e}");
               attempt += 1;
               time::sleep(WRITE_RETRY_DELAY).await;
            },
            Err(e) => {
               error!("{device}: write failed after {WRITE_ATTEMPTS} attempts: {e}");
               return Err(e);
            },
         }
      }
   }

   fn handle_data(&mut self, generation: u64, packet: &[u8]) {
      let Some(session) = self.session.as_mut().filter(|s| s.generation == generation) else {
         return;
      };
      session.monitor.touch(Instant::now());
      let device = session.device_id();
      debug!("← {device}: {}", hex::encode(packet));

      let Some(event) = protocol::decode(packet) else {
         debug!("{device}: ignoring {}-byte frame", packet.len());
         return;
      };
      if !event.complete {
         debug!("{device}: truncated {} frame", event.dialect);
      }
      let _ = self.telemetry.send(event);
      if let Some(status) = StatusUpdate::from_telemetry(&event) {
         self.event_tx.emit(device, LinkEvent::StatusUpdated(status));
      }
      self.event_tx.emit(device, LinkEvent::Telemetry(event));
   }

   // === Liveness ===

   async fn heartbeat(&mut self, generation: u64) {
      let Some(session) = self
         .session
         .as_mut()
         .filter(|s| s.generation == generation && s.state == LinkState::Ready)
      else {
         return;
      };
      let writer = session.layout.and_then(|l| l.writer());
      let action = session
         .monitor
         .heartbeat(Instant::now(), writer.is_some(), session.dialect);
      let device = session.device_id().clone();

      match (action, writer) {
         (HeartbeatAction::Probe(frame), Some(writer)) => {
            debug!("→ {device}: heartbeat {}", hex::encode(&frame));
            if let Err(e) = self.transport.write(&device, writer, &frame).await {
               warn!("{device}: heartbeat failed: {e}, checking link");
               self.check_liveness(generation).await;
            }
         },
         _ => debug!("{device}: nothing to write, assuming alive"),
      }
   }

   async fn check_liveness(&mut self, generation: u64) {
      let Some(session) = self
         .session
         .as_mut()
         .filter(|s| s.generation == generation && s.state == LinkState::Ready)
      else {
         return;
      };
      let now = Instant::now();
      if !session.monitor.needs_probe(now) {
         return;
      }
      let device = session.device_id().clone();
      let silent = session.monitor.silent_for(now);
      let Some(reader) = session.layout.and_then(|l| l.reader()) else {
         debug!("{device}: silent for {}s, nothing readable to probe", silent.as_secs());
         return;
      };

      info!("{device}: silent for {}s, probing link", silent.as_secs());
      match self.transport.read(&device, reader).await {
         Ok(packet) => {
            debug!("← {device}: {}", hex::encode(&packet));
            session.monitor.touch(Instant::now());
         },
         Err(e) => {
            warn!("{device}: silent and unreadable ({e}), treating link as lost");
            self.handle_link_lost(LinkError::UnexpectedDisconnect).await;
         },
      }
   }

   // === Exclusive access ===

   fn poll_guard(&mut self, generation: u64) {
      if !self.exclusive_mode || self.guard_busy {
         return;
      }
      let Some(session) = self
         .session
         .as_mut()
         .filter(|s| s.generation == generation && s.state == LinkState::Ready)
      else {
         return;
      };
      self.guard_busy = true;
      let transport = self.transport.clone();
      let validator = self.validator.clone();
      let owned = session.device_id().clone();
      let loopback = self.loopback_tx.clone();
      session.tasks.spawn(async move {
         let captures = find_foreign_captures(&*transport, &validator, &owned).await;
         let _ = loopback
            .send(ManagerCommand::ForeignCaptures(generation, captures))
            .await;
      });
   }

   fn handle_captures(&mut self, generation: u64, captures: Vec<CaptureRecord>) {
      self.guard_busy = false;
      let Some(session) = self.session.as_ref().filter(|s| s.generation == generation) else {
         return;
      };
      if captures.is_empty() {
         return;
      }
      let device = session.device_id();
      for capture in captures {
         if self.guard.record(capture.clone()) {
            let prompt = capture.prompt();
            self.event_tx.emit(
               device,
               LinkEvent::ForeignCapture {
                  record: capture,
                  prompt,
               },
            );
         }
      }
      if let Some(store) = &self.store
         && let Err(e) = store.save_captures(&self.guard.recent())
      {
         warn!("Failed to persist capture log: {e}");
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up link manager");
      self.stop_scan().await;
      self.teardown(LinkError::ManagerShutdown, "Manager shut down").await;
   }
}
