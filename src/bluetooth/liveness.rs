//! Silent link death detection.
//!
//! The platform does not always report a dropped link. The monitor tracks when
//! data was last seen; the manager probes with a heartbeat write on one timer
//! and, on another, reads the link directly once it has been silent too long.

use std::time::Duration;

use tokio::{
   sync::mpsc,
   task::JoinSet,
   time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::device::protocol::{Command, Frame, FrameDialect};

/// What the heartbeat timer should do on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
   /// Write this frame to the writable characteristic.
   Probe(Frame),
   /// Nothing to write to; the device is assumed alive.
   AssumeAlive,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
   last_data_at: Instant,
   silence_threshold: Duration,
}

impl HeartbeatMonitor {
   pub const fn new(now: Instant, silence_threshold: Duration) -> Self {
      Self {
         last_data_at: now,
         silence_threshold,
      }
   }

   pub const fn last_data_at(&self) -> Instant {
      self.last_data_at
   }

   /// Data arrived or a liveness read succeeded.
   pub fn touch(&mut self, now: Instant) {
      self.last_data_at = self.last_data_at.max(now);
   }

   pub fn silent_for(&self, now: Instant) -> Duration {
      now.saturating_duration_since(self.last_data_at)
   }

   /// True once the link has been silent for longer than the threshold.
   pub fn needs_probe(&self, now: Instant) -> bool {
      self.silent_for(now) > self.silence_threshold
   }

   pub fn heartbeat(&mut self, now: Instant, writable: bool, dialect: FrameDialect) -> HeartbeatAction {
      if writable {
         HeartbeatAction::Probe(Command::Heartbeat.encode(dialect))
      } else {
         self.touch(now);
         HeartbeatAction::AssumeAlive
      }
   }
}

/// Spawns a periodic task into the session's task set that posts `msg()` to
/// the manager until cancelled. The first tick fires one period from now.
pub fn spawn_ticker<M, F>(
   tasks: &mut JoinSet<()>,
   cancel: CancellationToken,
   period: Duration,
   loopback: mpsc::Sender<M>,
   msg: F,
) where
   M: Send + 'static,
   F: Fn() -> M + Send + 'static,
{
   tasks.spawn(async move {
      let mut interval = time::interval_at(Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
         tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
               if loopback.send(msg()).await.is_err() {
                  break;
               }
            },
         }
      }
   });
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_silence_threshold_is_strict() {
      let start = Instant::now();
      let mut monitor = HeartbeatMonitor::new(start, Duration::from_secs(30));
      assert!(!monitor.needs_probe(start + Duration::from_secs(30)));
      assert!(monitor.needs_probe(start + Duration::from_secs(31)));

      monitor.touch(start + Duration::from_secs(31));
      assert!(!monitor.needs_probe(start + Duration::from_secs(45)));
      assert_eq!(monitor.last_data_at(), start + Duration::from_secs(31));
   }

   #[test]
   fn test_heartbeat_without_writer_refreshes_clock() {
      let start = Instant::now();
      let mut monitor = HeartbeatMonitor::new(start, Duration::from_secs(30));
      let later = start + Duration::from_secs(40);
      assert_eq!(
         monitor.heartbeat(later, false, FrameDialect::Canonical),
         HeartbeatAction::AssumeAlive
      );
      assert!(!monitor.needs_probe(later));

      let HeartbeatAction::Probe(frame) = monitor.heartbeat(later, true, FrameDialect::Canonical)
      else {
         panic!("expected a probe frame");
      };
      assert_eq!(frame.as_slice(), &[0xAA, 0xFF, 0x00, 0x00, 0xAB]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_ticker_stops_on_cancel() {
      let mut tasks = JoinSet::new();
      let cancel = CancellationToken::new();
      let (tx, mut rx) = mpsc::channel(8);
      spawn_ticker(&mut tasks, cancel.clone(), Duration::from_secs(10), tx, || 7u8);

      assert_eq!(rx.recv().await, Some(7));
      cancel.cancel();
      while tasks.join_next().await.is_some() {}
      assert!(rx.recv().await.is_none());
   }
}
