//! Device authorization.
//!
//! A verdict is computed by [`evaluate`], a pure function over a
//! [`TrustContext`]: the remote answer (if any), the cached allow-list
//! snapshot and the static fallback names. [`AuthorizationValidator`] gathers
//! that context, owns the snapshot cache and talks to the remote service.

use std::{
   sync::Arc,
   time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
   config::{HostConfig, WhitelistConfig},
   device::recognition::MacAddress,
   error::Result,
   whitelist::{
      client::{AllowListService, REASON_MAX_USERS, RemoteVerification, WhitelistEntry},
      store::WhitelistStore,
   },
};

/// Names used by the platform for audio routed through the host itself.
const SELF_DEVICE_SENTINELS: &[&str] = &[
   "current_device",
   "local_device",
   "host_device",
   "phone_speaker",
   "internal_audio",
];

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictReason {
   None,
   NotWhitelisted,
   QuotaExhausted,
   ValidatorUnavailable,
}

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictSource {
   Remote,
   Cached,
   Hardcoded,
   SelfDevice,
}

/// Outcome of validating one device. `can_bind` implies `is_allowed`, the
/// constructors are the only way to build one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthorizationVerdict {
   is_allowed: bool,
   can_bind: bool,
   reason: VerdictReason,
   source: VerdictSource,
}

impl AuthorizationVerdict {
   pub const fn allow(source: VerdictSource, can_bind: bool) -> Self {
      Self {
         is_allowed: true,
         can_bind,
         reason: VerdictReason::None,
         source,
      }
   }

   pub const fn deny(source: VerdictSource, reason: VerdictReason) -> Self {
      Self {
         is_allowed: false,
         can_bind: false,
         reason,
         source,
      }
   }

   pub const fn is_allowed(&self) -> bool {
      self.is_allowed
   }

   pub const fn can_bind(&self) -> bool {
      self.can_bind
   }

   pub const fn reason(&self) -> VerdictReason {
      self.reason
   }

   pub const fn source(&self) -> VerdictSource {
      self.source
   }
}

/// Allow-list snapshot with its fetch time in unix seconds.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
   pub fetched_at: u64,
   pub entries: Vec<WhitelistEntry>,
}

impl Snapshot {
   pub fn age(&self, now: u64) -> Duration {
      Duration::from_secs(now.saturating_sub(self.fetched_at))
   }

   pub fn is_fresh(&self, now: u64, ttl: Duration) -> bool {
      self.fetched_at != 0 && self.age(now) < ttl
   }

   fn lookup(&self, mac: &MacAddress) -> Option<&WhitelistEntry> {
      self
         .entries
         .iter()
         .find(|e| e.is_active && e.mac().as_ref() == Some(mac))
   }
}

/// Everything a verdict depends on.
pub struct TrustContext<'a> {
   pub host: &'a HostConfig,
   /// Tier 1; `None` when unreachable or disabled.
   pub remote: Option<&'a RemoteVerification>,
   /// Tier 2.
   pub cached: Option<&'a Snapshot>,
   pub cache_ttl: Duration,
   pub now: u64,
   /// Tier 3; `None` in strict mode.
   pub fallback_names: Option<&'a [String]>,
}

/// Audio routed back through the host's own output, never rejected.
pub fn is_self_device(host: &HostConfig, mac: Option<&MacAddress>, name: &str) -> bool {
   if mac.is_none_or(MacAddress::is_zero) {
      return true;
   }
   let name = name.trim().to_lowercase();
   if name.is_empty() {
      return false;
   }
   if SELF_DEVICE_SENTINELS.contains(&name.as_str()) {
      return true;
   }
   [&host.model, &host.brand]
      .into_iter()
      .flatten()
      .map(|s| s.trim().to_lowercase())
      .any(|s| s.len() >= 2 && name.contains(&s))
}

fn match_entry(entry: Option<&WhitelistEntry>, source: VerdictSource) -> AuthorizationVerdict {
   match entry {
      Some(entry) if entry.has_quota() => AuthorizationVerdict::allow(source, true),
      Some(_) => AuthorizationVerdict::deny(source, VerdictReason::QuotaExhausted),
      None => AuthorizationVerdict::deny(source, VerdictReason::NotWhitelisted),
   }
}

/// A full device may come back as listed-but-unbindable, or as not listed
/// with `max_users_reached`. Both are quota denials.
fn remote_verdict(mac: &MacAddress, remote: &RemoteVerification) -> AuthorizationVerdict {
   if let Some(reason) = &remote.reason {
      debug!("Remote verdict for {mac}: {reason}");
   }
   let full = remote.reason.as_deref() == Some(REASON_MAX_USERS)
      || remote.device_info.as_ref().is_some_and(|e| !e.has_quota());
   match (remote.is_whitelisted, remote.can_bind && !full) {
      (true, true) => AuthorizationVerdict::allow(VerdictSource::Remote, true),
      (true, false) => {
         AuthorizationVerdict::deny(VerdictSource::Remote, VerdictReason::QuotaExhausted)
      },
      (false, _) if full => {
         AuthorizationVerdict::deny(VerdictSource::Remote, VerdictReason::QuotaExhausted)
      },
      (false, _) => {
         AuthorizationVerdict::deny(VerdictSource::Remote, VerdictReason::NotWhitelisted)
      },
   }
}

/// Walks the trust tiers in order and returns the first answer.
pub fn evaluate(ctx: &TrustContext<'_>, mac: Option<&MacAddress>, name: &str) -> AuthorizationVerdict {
   if is_self_device(ctx.host, mac, name) {
      debug!("{name:?} is the host device, allowing");
      return AuthorizationVerdict::allow(VerdictSource::SelfDevice, false);
   }
   let Some(mac) = mac else {
      return AuthorizationVerdict::allow(VerdictSource::SelfDevice, false);
   };

   if let Some(remote) = ctx.remote {
      return remote_verdict(mac, remote);
   }

   if let Some(snapshot) = ctx.cached
      && snapshot.is_fresh(ctx.now, ctx.cache_ttl)
   {
      debug!("Checking {mac} against cached allow-list ({} entries)", snapshot.entries.len());
      return match_entry(snapshot.lookup(mac), VerdictSource::Cached);
   }

   let Some(names) = ctx.fallback_names else {
      warn!("Allow-list unreachable and strict mode is on, denying {mac}");
      return AuthorizationVerdict::deny(VerdictSource::Hardcoded, VerdictReason::ValidatorUnavailable);
   };
   warn!("Allow-list unreachable, using hardcoded name list for {name:?} ({mac})");
   let lowered = name.to_lowercase();
   if names.iter().any(|n| !n.is_empty() && lowered.contains(&n.to_lowercase())) {
      AuthorizationVerdict::allow(VerdictSource::Hardcoded, false)
   } else {
      AuthorizationVerdict::deny(VerdictSource::Hardcoded, VerdictReason::ValidatorUnavailable)
   }
}

pub fn unix_now() -> u64 {
   SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| d.as_secs())
}

/// Cache status as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
   pub has_cache: bool,
   pub age_secs: Option<u64>,
   pub expired: bool,
   pub device_count: usize,
   pub in_cooldown: bool,
   pub strict_mode: bool,
}

#[derive(Default)]
struct CacheState {
   snapshot: Option<Snapshot>,
   last_failure: Option<u64>,
}

/// Verifies devices against the trust tiers and keeps the snapshot cache.
pub struct AuthorizationValidator {
   service: Arc<dyn AllowListService>,
   store: Option<WhitelistStore>,
   config: WhitelistConfig,
   host: HostConfig,
   cache: Mutex<CacheState>,
}

impl AuthorizationValidator {
   pub fn new(
      service: Arc<dyn AllowListService>,
      store: Option<WhitelistStore>,
      config: WhitelistConfig,
      host: HostConfig,
   ) -> Self {
      let snapshot = store.as_ref().and_then(|s| match s.load_snapshot() {
         Ok(snapshot) => snapshot,
         Err(e) => {
            warn!("Failed to load cached allow-list: {e}");
            None
         },
      });
      if let Some(snapshot) = &snapshot {
         info!(
            "Loaded cached allow-list with {} entries ({}s old)",
            snapshot.entries.len(),
            snapshot.age(unix_now()).as_secs()
         );
      }
      Self {
         service,
         store,
         config,
         host,
         cache: Mutex::new(CacheState {
            snapshot,
            last_failure: None,
         }),
      }
   }

   const fn cache_ttl(&self) -> Duration {
      Duration::from_secs(self.config.cache_ttl_secs)
   }

   /// Never fails: service errors degrade to the next tier.
   pub async fn verify(&self, mac: Option<&MacAddress>, name: &str) -> AuthorizationVerdict {
      let mut remote = None;
      let mut cached = None;
      if !is_self_device(&self.host, mac, name)
         && let Some(mac) = mac
      {
         if self.config.enabled {
            match self.service.verify(mac, name).await {
               Ok(answer) => remote = Some(answer),
               Err(e) => warn!("Allow-list verify failed for {mac}: {e}, falling back"),
            }
         }
         if remote.is_none() {
            cached = self.cached_snapshot().await;
         }
      }

      let fallback = (!self.config.strict_mode).then_some(self.config.fallback_names.as_slice());
      let ctx = TrustContext {
         host: &self.host,
         remote: remote.as_ref(),
         cached: cached.as_ref(),
         cache_ttl: self.cache_ttl(),
         now: unix_now(),
         fallback_names: fallback,
      };
      let verdict = evaluate(&ctx, mac, name);
      info!(
         "Authorization for {name:?}: allowed={} can_bind={} reason={} source={}",
         verdict.is_allowed(),
         verdict.can_bind(),
         verdict.reason(),
         verdict.source()
      );
      verdict
   }

   /// Current snapshot, refetched when stale unless the failure cooldown is
   /// still running.
   async fn cached_snapshot(&self) -> Option<Snapshot> {
      let now = unix_now();
      {
         let cache = self.cache.lock();
         if let Some(snapshot) = &cache.snapshot
            && snapshot.is_fresh(now, self.cache_ttl())
         {
            return Some(snapshot.clone());
         }
         let cooldown = Duration::from_secs(self.config.failure_cooldown_secs);
         if let Some(failed_at) = cache.last_failure
            && Duration::from_secs(now.saturating_sub(failed_at)) < cooldown
         {
            debug!("Allow-list fetch in cooldown, using stale cache");
            return cache.snapshot.clone();
         }
         if !self.config.enabled {
            return cache.snapshot.clone();
         }
      }
      match self.refresh().await {
         Ok(snapshot) => Some(snapshot),
         Err(_) => self.cache.lock().snapshot.clone(),
      }
   }

   /// Refetches the allow-list, ignoring freshness and cooldown.
   pub async fn refresh(&self) -> Result<Snapshot> {
      let entries = match self.service.whitelist().await {
         Ok(entries) => entries,
         Err(e) => {
            warn!("Failed to fetch allow-list: {e}");
            self.cache.lock().last_failure = Some(unix_now());
            return Err(e);
         },
      };
      let snapshot = Snapshot {
         fetched_at: unix_now(),
         entries,
      };
      info!("Fetched allow-list with {} entries", snapshot.entries.len());
      {
         let mut cache = self.cache.lock();
         cache.snapshot = Some(snapshot.clone());
         cache.last_failure = None;
      }
      self.persist(&snapshot);
      Ok(snapshot)
   }

   fn persist(&self, snapshot: &Snapshot) {
      if let Some(store) = &self.store
         && let Err(e) = store.save_snapshot(snapshot)
      {
         warn!("Failed to persist allow-list: {e}");
      }
   }

   /// Marks the snapshot stale so the next validation refetches it.
   fn invalidate(&self) {
      let snapshot = {
         let mut cache = self.cache.lock();
         let Some(snapshot) = cache.snapshot.as_mut() else {
            return;
         };
         snapshot.fetched_at = 0;
         snapshot.clone()
      };
      self.persist(&snapshot);
   }

   /// Records the binding. Failures are logged and swallowed.
   pub async fn bind(&self, mac: &MacAddress, name: &str) {
      match self.service.bind(mac, name).await {
         Ok(()) => {
            info!("Bound {name:?} ({mac})");
            self.invalidate();
         },
         Err(e) => warn!("Failed to record binding for {mac}: {e}"),
      }
   }

   /// Releases the binding. Failures are logged and swallowed.
   pub async fn unbind(&self, mac: &MacAddress) -> bool {
      match self.service.unbind(mac).await {
         Ok(()) => {
            info!("Unbound {mac}");
            self.invalidate();
            true
         },
         Err(e) => {
            warn!("Failed to unbind {mac}: {e}");
            false
         },
      }
   }

   pub async fn my_devices(&self) -> Result<Vec<WhitelistEntry>> {
      self.service.my_devices().await
   }

   pub fn cache_info(&self) -> CacheInfo {
      let now = unix_now();
      let cache = self.cache.lock();
      let cooldown = Duration::from_secs(self.config.failure_cooldown_secs);
      CacheInfo {
         has_cache: cache.snapshot.is_some(),
         age_secs: cache.snapshot.as_ref().map(|s| s.age(now).as_secs()),
         expired: !cache
            .snapshot
            .as_ref()
            .is_some_and(|s| s.is_fresh(now, self.cache_ttl())),
         device_count: cache.snapshot.as_ref().map_or(0, |s| s.entries.len()),
         in_cooldown: cache
            .last_failure
            .is_some_and(|t| Duration::from_secs(now.saturating_sub(t)) < cooldown),
         strict_mode: self.config.strict_mode,
      }
   }

   #[cfg(test)]
   pub(crate) fn seed(&self, snapshot: Snapshot) {
      self.cache.lock().snapshot = Some(snapshot);
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::testing::FakeAllowList;

   const MAC: &str = "11:29:AA:25:4A:58";

   fn entry(mac: &str, max_users: u32, current_bindings: u32) -> WhitelistEntry {
      WhitelistEntry {
         mac_address: mac.into(),
         device_name: "BT-Music".into(),
         device_type: None,
         manufacturer: None,
         model: None,
         max_users,
         current_bindings,
         is_active: true,
      }
   }

   fn context<'a>(
      host: &'a HostConfig,
      remote: Option<&'a RemoteVerification>,
      cached: Option<&'a Snapshot>,
      fallback: Option<&'a [String]>,
   ) -> TrustContext<'a> {
      TrustContext {
         host,
         remote,
         cached,
         cache_ttl: Duration::from_secs(1800),
         now: 10_000,
         fallback_names: fallback,
      }
   }

   fn validator(service: Arc<FakeAllowList>, config: WhitelistConfig) -> AuthorizationValidator {
      AuthorizationValidator::new(service, None, config, HostConfig::default())
   }

   #[test]
   fn test_zero_or_missing_mac_is_always_allowed() {
      let host = HostConfig::default();
      let denial = RemoteVerification::default();
      let ctx = context(&host, Some(&denial), None, None);
      for mac in [None, Some(MacAddress::ZERO)] {
         let verdict = evaluate(&ctx, mac.as_ref(), "anything");
         assert!(verdict.is_allowed());
         assert_eq!(verdict.source(), VerdictSource::SelfDevice);
      }
   }

   #[test]
   fn test_host_identity_is_allowed() {
      let host = HostConfig {
         model: Some("ThinkPad X1".into()),
         brand: Some("LENOVO".into()),
      };
      let mac = MacAddress::parse(MAC).unwrap();
      let ctx = context(&host, None, None, None);
      assert!(evaluate(&ctx, Some(&mac), "lenovo speakers").is_allowed());
      assert!(evaluate(&ctx, Some(&mac), "internal_audio").is_allowed());
      assert!(!evaluate(&ctx, Some(&mac), "Pillow").is_allowed());
   }

   #[test]
   fn test_can_bind_implies_allowed() {
      let host = HostConfig::default();
      let mac = MacAddress::parse(MAC).unwrap();
      let names = vec!["BT-Music".to_string()];
      let fresh = Snapshot {
         fetched_at: 9_000,
         entries: vec![entry(MAC, 1, 1)],
      };
      let remotes = [
         RemoteVerification {
            is_whitelisted: true,
            can_bind: true,
            ..Default::default()
         },
         RemoteVerification {
            is_whitelisted: true,
            can_bind: false,
            ..Default::default()
         },
         RemoteVerification {
            is_whitelisted: false,
            can_bind: true,
            ..Default::default()
         },
      ];
      let mut verdicts = vec![];
      for remote in &remotes {
         verdicts.push(evaluate(&context(&host, Some(remote), None, None), Some(&mac), "x"));
      }
      for fallback in [None, Some(names.as_slice())] {
         for cached in [None, Some(&fresh)] {
            for name in ["BT-Music", "other", ""] {
               let ctx = context(&host, None, cached, fallback);
               verdicts.push(evaluate(&ctx, Some(&mac), name));
            }
         }
      }
      for verdict in verdicts {
         assert!(!verdict.can_bind() || verdict.is_allowed(), "{verdict:?}");
      }
   }

   #[test]
   fn test_remote_reason_and_device_info_mark_full_devices() {
      let host = HostConfig::default();
      let mac = MacAddress::parse(MAC).unwrap();
      let check = |remote: &RemoteVerification| {
         evaluate(&context(&host, Some(remote), None, None), Some(&mac), "x")
      };

      let unlisted_full = RemoteVerification {
         is_whitelisted: false,
         reason: Some(REASON_MAX_USERS.into()),
         ..Default::default()
      };
      assert_eq!(check(&unlisted_full).reason(), VerdictReason::QuotaExhausted);

      let stale_flag = RemoteVerification {
         is_whitelisted: true,
         can_bind: true,
         device_info: Some(entry(MAC, 2, 2)),
         ..Default::default()
      };
      assert_eq!(
         check(&stale_flag),
         AuthorizationVerdict::deny(VerdictSource::Remote, VerdictReason::QuotaExhausted)
      );

      let unlisted = RemoteVerification {
         reason: Some("not_in_whitelist".into()),
         ..Default::default()
      };
      assert_eq!(check(&unlisted).reason(), VerdictReason::NotWhitelisted);

      let open = RemoteVerification {
         is_whitelisted: true,
         can_bind: true,
         device_info: Some(entry(MAC, 2, 1)),
         ..Default::default()
      };
      assert!(check(&open).can_bind());
   }

   #[test]
   fn test_labels_match_wire_names() {
      for (source, name) in [
         (VerdictSource::SelfDevice, "self_device"),
         (VerdictSource::Remote, "remote"),
      ] {
         assert_eq!(source.to_string(), name);
         assert_eq!(serde_json::to_value(source).unwrap(), name);
      }
      assert_eq!(VerdictReason::QuotaExhausted.to_string(), "quota_exhausted");
   }

   #[test]
   fn test_tier_order() {
      let host = HostConfig::default();
      let mac = MacAddress::parse(MAC).unwrap();
      let names = vec!["bt-music".to_string()];
      let fresh = Snapshot {
         fetched_at: 9_000,
         entries: vec![entry(MAC, 2, 1)],
      };
      let stale = Snapshot {
         fetched_at: 1,
         ..fresh.clone()
      };
      let exhausted = Snapshot {
         fetched_at: 9_000,
         entries: vec![entry(MAC, 1, 1)],
      };

      let verdict = evaluate(&context(&host, None, Some(&fresh), None), Some(&mac), "BT-Music");
      assert_eq!(verdict, AuthorizationVerdict::allow(VerdictSource::Cached, true));

      let verdict = evaluate(&context(&host, None, Some(&exhausted), None), Some(&mac), "x");
      assert_eq!(verdict.reason(), VerdictReason::QuotaExhausted);
      assert!(!verdict.is_allowed());

      let verdict = evaluate(
         &context(&host, None, Some(&stale), Some(names.as_slice())),
         Some(&mac),
         "BT-MUSIC 2",
      );
      assert_eq!(verdict, AuthorizationVerdict::allow(VerdictSource::Hardcoded, false));

      let verdict = evaluate(&context(&host, None, None, Some(names.as_slice())), Some(&mac), "Lamp");
      assert_eq!(verdict.reason(), VerdictReason::ValidatorUnavailable);

      // strict mode
      let verdict = evaluate(&context(&host, None, Some(&stale), None), Some(&mac), "BT-Music");
      assert_eq!(
         verdict,
         AuthorizationVerdict::deny(VerdictSource::Hardcoded, VerdictReason::ValidatorUnavailable)
      );
   }

   #[tokio::test]
   async fn test_remote_timeout_falls_back_to_fresh_cache() {
      let service = Arc::new(FakeAllowList::unreachable());
      let validator = validator(service.clone(), WhitelistConfig::default());
      validator.seed(Snapshot {
         fetched_at: unix_now(),
         entries: vec![entry(MAC, 3, 0)],
      });

      let mac = MacAddress::parse(MAC).unwrap();
      let verdict = validator.verify(Some(&mac), "Pillow").await;
      assert_eq!(verdict, AuthorizationVerdict::allow(VerdictSource::Cached, true));
      assert_eq!(service.whitelist_calls(), 0);
   }

   #[tokio::test]
   async fn test_remote_timeout_without_cache_uses_hardcoded_tier() {
      let service = Arc::new(FakeAllowList::unreachable());
      let validator = validator(service.clone(), WhitelistConfig::default());
      let mac = MacAddress::parse(MAC).unwrap();

      let verdict = validator.verify(Some(&mac), "BT-Music").await;
      assert_eq!(verdict, AuthorizationVerdict::allow(VerdictSource::Hardcoded, false));
      assert_eq!(service.whitelist_calls(), 1);

      // second miss is inside the cooldown, no refetch
      let verdict = validator.verify(Some(&mac), "Lamp").await;
      assert!(!verdict.is_allowed());
      assert_eq!(service.whitelist_calls(), 1);
      assert!(validator.cache_info().in_cooldown);
   }

   #[tokio::test]
   async fn test_stale_cache_is_refetched() {
      let service = Arc::new(FakeAllowList::new(vec![entry(MAC, 1, 0)]));
      service.fail_verify(true);
      let validator = validator(service.clone(), WhitelistConfig::default());
      validator.seed(Snapshot {
         fetched_at: 1,
         entries: vec![],
      });

      let mac = MacAddress::parse(MAC).unwrap();
      let verdict = validator.verify(Some(&mac), "Pillow").await;
      assert_eq!(verdict, AuthorizationVerdict::allow(VerdictSource::Cached, true));
      assert_eq!(service.whitelist_calls(), 1);
      assert!(!validator.cache_info().expired);
   }

   #[tokio::test]
   async fn test_bind_invalidates_freshness_and_failures_are_swallowed() {
      let service = Arc::new(FakeAllowList::new(vec![entry(MAC, 1, 0)]));
      let validator = validator(service.clone(), WhitelistConfig::default());
      validator.refresh().await.unwrap();
      assert!(!validator.cache_info().expired);

      let mac = MacAddress::parse(MAC).unwrap();
      validator.bind(&mac, "BT-Music").await;
      assert!(validator.cache_info().expired);
      assert_eq!(service.bind_calls(), 1);

      service.fail_bind(true);
      validator.bind(&mac, "BT-Music").await;
      assert!(!validator.unbind(&mac).await);
   }

   #[tokio::test]
   async fn test_disabled_remote_uses_cache_only() {
      let service = Arc::new(FakeAllowList::new(vec![entry(MAC, 1, 0)]));
      let config = WhitelistConfig {
         enabled: false,
         ..WhitelistConfig::default()
      };
      let validator = validator(service.clone(), config);
      let mac = MacAddress::parse(MAC).unwrap();

      let verdict = validator.verify(Some(&mac), "Lamp").await;
      assert_eq!(verdict.source(), VerdictSource::Hardcoded);
      assert_eq!(service.verify_calls(), 0);
      assert_eq!(service.whitelist_calls(), 0);
   }
}
