//! Wire protocol of the accessory firmware.
//!
//! Commands are framed as `[start, opcode, arg1, arg2, end]`. Firmware in the
//! field speaks one of several framing dialects, so decoding picks a dialect
//! from structural predicates and falls back to a best-effort generic parse
//! instead of rejecting malformed input.

use log::warn;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Raw frame bytes.
pub type Frame = SmallVec<[u8; 8]>;

pub const CANONICAL_START: u8 = 0xAA;
pub const CANONICAL_END: u8 = 0xAB;
pub const ALTERNATE_START: u8 = 0xFE;
pub const ALTERNATE_END: u8 = 0xFF;
pub const MINIMAL_MARKER: u8 = 0xFF;

/// Upper bound for percentage arguments (volume, brightness).
pub const MAX_LEVEL: u8 = 100;

/// Candidate handshake frames. Each firmware family answers a different
/// subset, so all of them are sent.
pub const HANDSHAKE_SEQUENCE: &[&[u8]] = &[
   &[0xAA, 0x01, 0x00, 0x00, 0xAB],
   &[0xAA, 0x10, 0x01, 0x00, 0xAB],
   &[0xFE, 0xFE, 0x01],
   &[0xFF, 0xFF, 0x01],
   &[0xAA, 0xFF],
];

/// Name fragments of firmware that neither answers a handshake nor survives
/// automatic reconnects (case-insensitive).
const NO_HANDSHAKE_PATTERNS: &[&str] = &["edifier"];

/// Known opcodes.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum Opcode {
   #[strum(serialize = "status")]
   Status = 0x01,
   #[strum(serialize = "timer_report")]
   TimerReport = 0x02,
   #[strum(serialize = "power")]
   Power = 0x10,
   #[strum(serialize = "mode")]
   Mode = 0x11,
   #[strum(serialize = "volume")]
   Volume = 0x12,
   #[strum(serialize = "brightness")]
   Brightness = 0x13,
   #[strum(serialize = "sleep_timer")]
   SleepTimer = 0x14,
   #[strum(serialize = "heartbeat")]
   Heartbeat = 0xFF,
}

/// Playback modes of the accessory.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
   #[strum(serialize = "sleep")]
   Sleep = 0,
   #[strum(serialize = "relax")]
   Relax = 1,
   #[strum(serialize = "focus")]
   Focus = 2,
}

/// Outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
   QueryStatus,
   Power(bool),
   Mode(Mode),
   Volume(u8),
   Brightness(u8),
   SleepTimer(u8),
   Heartbeat,
   Raw { opcode: u8, arg1: u8, arg2: u8 },
}

impl Command {
   pub const fn opcode(self) -> u8 {
      match self {
         Self::QueryStatus => Opcode::Status as u8,
         Self::Power(_) => Opcode::Power as u8,
         Self::Mode(_) => Opcode::Mode as u8,
         Self::Volume(_) => Opcode::Volume as u8,
         Self::Brightness(_) => Opcode::Brightness as u8,
         Self::SleepTimer(_) => Opcode::SleepTimer as u8,
         Self::Heartbeat => Opcode::Heartbeat as u8,
         Self::Raw { opcode, .. } => opcode,
      }
   }

   /// Returns `(arg1, arg2)`. Percentages above 100 are clamped.
   pub fn args(self) -> (u8, u8) {
      match self {
         Self::QueryStatus | Self::Heartbeat => (0, 0),
         Self::Power(on) => (u8::from(on), 0),
         Self::Mode(mode) => (mode as u8, 0),
         Self::Volume(level) => (clamp_level("volume", level), 0),
         Self::Brightness(level) => (clamp_level("brightness", level), 0),
         Self::SleepTimer(minutes) => (minutes, 0),
         Self::Raw { arg1, arg2, .. } => (arg1, arg2),
      }
   }

   /// Frames the command in the given dialect.
   pub fn encode(self, dialect: FrameDialect) -> Frame {
      let (arg1, arg2) = self.args();
      dialect.encode(self.opcode(), arg1, arg2)
   }
}

fn clamp_level(what: &str, level: u8) -> u8 {
   if level > MAX_LEVEL {
      warn!("Clamping {what} {level} to {MAX_LEVEL}");
      MAX_LEVEL
   } else {
      level
   }
}

/// Framing convention spoken by a firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FrameDialect {
   /// `[0xAA, op, a1, a2, 0xAB]`
   #[default]
   #[strum(serialize = "canonical")]
   Canonical,
   /// `[0xFE, op, a1, a2, 0xFF]`
   #[strum(serialize = "alternate")]
   Alternate,
   /// `[marker, op, data]`
   #[strum(serialize = "minimal")]
   Minimal { marker: u8 },
   /// Unframed `[op, a1, a2]`, only produced by decoding.
   #[strum(serialize = "generic")]
   Generic,
}

type Predicate = fn(&[u8]) -> bool;

/// Ordered structural predicates; the first match wins.
const DETECTORS: &[(Predicate, FrameDialect)] = &[
   (|b| b[0] == CANONICAL_START, FrameDialect::Canonical),
   (|b| b[0] == ALTERNATE_START, FrameDialect::Alternate),
   (
      |b| b.len() >= 3 && (b[0] == MINIMAL_MARKER || b[b.len() - 1] == MINIMAL_MARKER),
      FrameDialect::Minimal { marker: MINIMAL_MARKER },
   ),
];

impl FrameDialect {
   /// Dialects tried, in order, when probing unknown firmware.
   pub const PROBE_ORDER: [Self; 3] = [
      Self::Canonical,
      Self::Alternate,
      Self::Minimal { marker: MINIMAL_MARKER },
   ];

   pub fn encode(self, opcode: u8, arg1: u8, arg2: u8) -> Frame {
      match self {
         Self::Canonical => Frame::from_slice(&[CANONICAL_START, opcode, arg1, arg2, CANONICAL_END]),
         Self::Alternate => Frame::from_slice(&[ALTERNATE_START, opcode, arg1, arg2, ALTERNATE_END]),
         Self::Minimal { marker } => Frame::from_slice(&[marker, opcode, arg1]),
         Self::Generic => Frame::from_slice(&[opcode, arg1, arg2]),
      }
   }

   /// Picks the dialect of an inbound frame. Never fails for frames of two
   /// bytes or more; unknown shapes are treated as generic.
   pub fn detect(bytes: &[u8]) -> Option<Self> {
      if bytes.len() < 2 {
         return None;
      }
      let dialect = DETECTORS
         .iter()
         .find(|(matches, _)| matches(bytes))
         .map_or(Self::Generic, |&(_, dialect)| dialect);
      Some(dialect)
   }

   fn decode_with(self, b: &[u8]) -> TelemetryEvent {
      let at = |i: usize| b.get(i).copied().unwrap_or(0);
      let (opcode, arg1, arg2, complete) = match self {
         Self::Canonical => (at(1), at(2), at(3), b.len() >= 5 && b[4] == CANONICAL_END),
         Self::Alternate => (at(1), at(2), at(3), b.len() >= 5 && b[4] == ALTERNATE_END),
         Self::Minimal { .. } => (at(1), at(2), 0, b.len() >= 3),
         Self::Generic => (at(0), at(1), at(2), b.len() >= 3),
      };
      TelemetryEvent {
         dialect: self,
         opcode,
         arg1,
         arg2,
         complete,
      }
   }
}

/// Decoded inbound frame. Missing bytes decode as zero and clear `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
   pub dialect: FrameDialect,
   pub opcode: u8,
   pub arg1: u8,
   pub arg2: u8,
   pub complete: bool,
}

impl TelemetryEvent {
   pub fn known_opcode(&self) -> Option<Opcode> {
      Opcode::from_repr(self.opcode)
   }
}

/// Decodes an inbound frame. Only frames shorter than two bytes yield `None`.
pub fn decode(bytes: &[u8]) -> Option<TelemetryEvent> {
   FrameDialect::detect(bytes).map(|dialect| dialect.decode_with(bytes))
}

/// Firmware behaviour that the state machine has to adapt to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeProfile {
   #[default]
   #[strum(serialize = "standard")]
   Standard,
   /// Skips the handshake and is never reconnected automatically.
   #[strum(serialize = "no_handshake")]
   NoHandshake,
}

impl HandshakeProfile {
   pub fn for_device(name: &str) -> Self {
      let name = name.to_ascii_lowercase();
      if NO_HANDSHAKE_PATTERNS.iter().any(|p| name.contains(p)) {
         Self::NoHandshake
      } else {
         Self::Standard
      }
   }

   pub const fn performs_handshake(self) -> bool {
      matches!(self, Self::Standard)
   }

   pub const fn reconnects(self) -> bool {
      matches!(self, Self::Standard)
   }
}

/// Device state reported by status and timer frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StatusUpdate {
   Status {
      powered: bool,
      mode: Option<Mode>,
      volume: u8,
      brightness: u8,
   },
   SleepTimer { minutes: u8 },
   Power { powered: bool },
}

impl StatusUpdate {
   /// Truncated frames yield nothing, their zero-filled bytes would read as
   /// a powered-off device.
   pub fn from_telemetry(event: &TelemetryEvent) -> Option<Self> {
      if !event.complete {
         return None;
      }
      match event.known_opcode() {
         Some(Opcode::Status) => Some(Self::Status {
            powered: event.arg1 & 0x01 != 0,
            mode: Mode::from_repr((event.arg1 >> 1) & 0x03),
            volume: event.arg2 & 0x7F,
            brightness: (event.arg1 >> 3).min(MAX_LEVEL),
         }),
         Some(Opcode::TimerReport) => Some(Self::SleepTimer {
            minutes: event.arg1,
         }),
         Some(Opcode::Heartbeat) => None,
         _ if event.arg1 <= 1 => Some(Self::Power {
            powered: event.arg1 == 1,
         }),
         _ => None,
      }
   }
}
