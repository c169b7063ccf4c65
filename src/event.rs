//! Event handling for link state changes.
//!
//! The manager reports everything a front end needs to render through these
//! events: discovery results, state transitions, decoded telemetry and
//! foreign-capture prompts.

use std::sync::Arc;

use crate::{
   bluetooth::{guard::CaptureRecord, scanner::DeviceRecord, session::LinkState, transport::DeviceId},
   device::protocol::{StatusUpdate, TelemetryEvent},
};

/// Events that can be emitted by the link manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
   DeviceFound(DeviceRecord),
   StateChanged(LinkState),
   Connected,
   Disconnected { message: String },
   ConnectFailed { message: String },
   Telemetry(TelemetryEvent),
   StatusUpdated(StatusUpdate),
   /// An allow-listed accessory is held by a connection outside the manager.
   ForeignCapture { record: CaptureRecord, prompt: String },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &DeviceId, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
