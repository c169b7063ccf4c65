//! HTTP client for the remote allow-list service.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   config::WhitelistConfig,
   device::recognition::MacAddress,
   error::{LinkError, Result},
};

/// One allow-list record as served by the remote service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WhitelistEntry {
   pub mac_address: SmolStr,
   #[serde(default)]
   pub device_name: SmolStr,
   #[serde(default)]
   pub device_type: Option<SmolStr>,
   #[serde(default)]
   pub manufacturer: Option<SmolStr>,
   #[serde(default)]
   pub model: Option<SmolStr>,
   #[serde(default = "default_max_users")]
   pub max_users: u32,
   #[serde(default)]
   pub current_bindings: u32,
   #[serde(default = "default_active")]
   pub is_active: bool,
}

const fn default_max_users() -> u32 {
   1
}

const fn default_active() -> bool {
   true
}

impl WhitelistEntry {
   pub fn mac(&self) -> Option<MacAddress> {
      MacAddress::parse(&self.mac_address)
   }

   pub const fn has_quota(&self) -> bool {
      self.current_bindings < self.max_users
   }
}

/// `reason` the verify endpoint gives for a listed device with no free slot.
pub const REASON_MAX_USERS: &str = "max_users_reached";

/// Answer of `POST /devices/verify`.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct RemoteVerification {
   pub is_whitelisted: bool,
   #[serde(default)]
   pub can_bind: bool,
   #[serde(default)]
   pub reason: Option<SmolStr>,
   #[serde(default)]
   pub device_info: Option<WhitelistEntry>,
}

/// Remote allow-list operations.
#[async_trait]
pub trait AllowListService: Send + Sync {
   async fn whitelist(&self) -> Result<Vec<WhitelistEntry>>;
   async fn verify(&self, mac: &MacAddress, name: &str) -> Result<RemoteVerification>;
   async fn bind(&self, mac: &MacAddress, name: &str) -> Result<()>;
   async fn unbind(&self, mac: &MacAddress) -> Result<()>;
   async fn my_devices(&self) -> Result<Vec<WhitelistEntry>>;
}

/// Responses arrive either bare or wrapped in `{success, data, error}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
   Wrapped {
      success: bool,
      data: Option<T>,
      error: Option<String>,
      message: Option<String>,
   },
   Bare(T),
}

impl<T> Envelope<T> {
   fn into_result(self) -> Result<Option<T>> {
      match self {
         Self::Bare(data) => Ok(Some(data)),
         Self::Wrapped {
            success: true,
            data,
            ..
         } => Ok(data),
         Self::Wrapped { error, message, .. } => Err(LinkError::AuthorizationServiceUnavailable(
            error
               .or(message)
               .unwrap_or_else(|| "request rejected".to_string())
               .into(),
         )),
      }
   }
}

/// `reqwest` backed [`AllowListService`].
pub struct HttpAllowList {
   client: Client,
   base_url: String,
   auth_token: Option<String>,
   verify_timeout: Duration,
   fetch_timeout: Duration,
}

impl HttpAllowList {
   pub fn new(config: &WhitelistConfig) -> Result<Self> {
      let fetch_timeout = Duration::from_secs(config.fetch_timeout_secs);
      let client = Client::builder().timeout(fetch_timeout).build()?;
      Ok(Self {
         client,
         base_url: config.base_url.trim_end_matches('/').to_string(),
         auth_token: config.auth_token.clone(),
         verify_timeout: Duration::from_secs(config.verify_timeout_secs),
         fetch_timeout,
      })
   }

   fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
      let url = format!("{}/{path}", self.base_url);
      debug!("{method} {url}");
      let request = self.client.request(method, url).timeout(timeout);
      match &self.auth_token {
         Some(token) => request.bearer_auth(token),
         None => request,
      }
   }

   async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<Option<T>> {
      let response = request.send().await?.error_for_status()?;
      response.json::<Envelope<T>>().await?.into_result()
   }
}

#[async_trait]
impl AllowListService for HttpAllowList {
   async fn whitelist(&self) -> Result<Vec<WhitelistEntry>> {
      let request = self.request(Method::GET, "devices/whitelist", self.fetch_timeout);
      Ok(Self::send(request).await?.unwrap_or_default())
   }

   async fn verify(&self, mac: &MacAddress, name: &str) -> Result<RemoteVerification> {
      let request = self
         .request(Method::POST, "devices/verify", self.verify_timeout)
         .json(&json!({ "mac_address": mac.to_string(), "device_name": name }));
      Self::send(request).await?.ok_or_else(|| {
         LinkError::AuthorizationServiceUnavailable("empty verify response".into())
      })
   }

   async fn bind(&self, mac: &MacAddress, name: &str) -> Result<()> {
      let request = self
         .request(Method::POST, "devices/bind", self.fetch_timeout)
         .json(&json!({ "mac_address": mac.to_string(), "device_name": name }));
      Self::send::<serde_json::Value>(request).await?;
      Ok(())
   }

   async fn unbind(&self, mac: &MacAddress) -> Result<()> {
      let request = self
         .request(Method::POST, "devices/unbind", self.fetch_timeout)
         .json(&json!({ "mac_address": mac.to_string() }));
      Self::send::<serde_json::Value>(request).await?;
      Ok(())
   }

   async fn my_devices(&self) -> Result<Vec<WhitelistEntry>> {
      let request = self.request(Method::GET, "devices/my-devices", self.fetch_timeout);
      Ok(Self::send(request).await?.unwrap_or_default())
   }
}
