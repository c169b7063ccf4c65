use std::{collections::HashMap, str::FromStr, sync::Arc};

use log::info;
use serde::Serialize;
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{
   bluetooth::{manager::LinkManager, scanner::ScanFilter, transport::DeviceId},
   device::{
      protocol::{Command, Mode},
      recognition::MacAddress,
   },
   error::LinkError,
   whitelist::validator::AuthorizationValidator,
};

fn failed(e: LinkError) -> zbus::fdo::Error {
   match e {
      LinkError::DeviceNotFound(_) => zbus::fdo::Error::InvalidArgs(e.user_message().into_owned()),
      _ => zbus::fdo::Error::Failed(e.user_message().into_owned()),
   }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
   serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn param<'a, 'v>(
   params: &'a HashMap<String, zvariant::Value<'v>>,
   key: &str,
) -> zbus::fdo::Result<&'a zvariant::Value<'v>> {
   params
      .get(key)
      .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Missing '{key}' parameter")))
}

/// Reads a byte-sized argument. Clients tend to send plain D-Bus integers, so
/// wider types are accepted as long as the value fits.
fn byte_param(params: &HashMap<String, zvariant::Value<'_>>, key: &str) -> zbus::fdo::Result<u8> {
   let value = param(params, key)?;
   let wide = if let Ok(v) = value.downcast_ref::<u8>() {
      i64::from(v)
   } else if let Ok(v) = value.downcast_ref::<u32>() {
      i64::from(v)
   } else if let Ok(v) = value.downcast_ref::<i32>() {
      i64::from(v)
   } else {
      return Err(zbus::fdo::Error::InvalidArgs(format!(
         "Invalid '{key}' parameter: expected an integer"
      )));
   };
   u8::try_from(wide)
      .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("'{key}' out of range: {wide}")))
}

fn parse_command(
   action: &str,
   params: &HashMap<String, zvariant::Value<'_>>,
) -> zbus::fdo::Result<Command> {
   let command = match action {
      "power" => {
         let on = param(params, "value")?.downcast_ref::<bool>().map_err(|e| {
            zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}"))
         })?;
         Command::Power(on)
      },
      "mode" => {
         let mode_str = param(params, "value")?
            .downcast_ref::<String>()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Invalid 'value' parameter: {e}")))?;
         let mode = Mode::from_str(&mode_str)
            .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid mode: {mode_str}")))?;
         Command::Mode(mode)
      },
      "volume" => Command::Volume(byte_param(params, "value")?),
      "brightness" => Command::Brightness(byte_param(params, "value")?),
      "sleep_timer" => Command::SleepTimer(byte_param(params, "minutes")?),
      "query_status" => Command::QueryStatus,
      "raw" => Command::Raw {
         opcode: byte_param(params, "opcode")?,
         arg1: byte_param(params, "arg1")?,
         arg2: byte_param(params, "arg2")?,
      },
      _ => {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Unknown action: {action}"
         )));
      },
   };
   Ok(command)
}

pub struct SleepLinkService {
   manager: LinkManager,
   validator: Arc<AuthorizationValidator>,
}

impl SleepLinkService {
   pub const fn new(manager: LinkManager, validator: Arc<AuthorizationValidator>) -> Self {
      Self { manager, validator }
   }
}

#[interface(name = "org.sleeplink")]
impl SleepLinkService {
   async fn start_scan(&self, audio_only: bool, name_prefix_only: bool) -> zbus::fdo::Result<bool> {
      self
         .manager
         .start_scan(ScanFilter {
            audio_only,
            name_prefix_only,
         })
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn stop_scan(&self) -> zbus::fdo::Result<bool> {
      self.manager.stop_scan().await.map_err(failed)?;
      Ok(true)
   }

   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      to_json(&self.manager.devices().await)
   }

   async fn connect(&self, device_id: String) -> zbus::fdo::Result<String> {
      let info = self
         .manager
         .connect(DeviceId::new(device_id))
         .await
         .map_err(failed)?;
      to_json(&info)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.manager.disconnect().await.map_err(failed)?;
      Ok(true)
   }

   async fn get_session(&self) -> zbus::fdo::Result<String> {
      to_json(&self.manager.session().await)
   }

   async fn send_command(
      &self,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let command = parse_command(&action, &params)?;
      self.manager.send(command).await.map_err(failed)?;
      info!("Sent {command:?}");
      Ok(true)
   }

   async fn passthrough(&self, packet: String) -> zbus::fdo::Result<bool> {
      let packet = hex::decode(packet).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self.manager.passthrough(&packet).await.map_err(failed)?;
      Ok(true)
   }

   async fn request_status(&self) -> zbus::fdo::Result<String> {
      let report = self.manager.request_status().await.map_err(failed)?;
      to_json(&report)
   }

   async fn refresh_whitelist(&self) -> zbus::fdo::Result<u32> {
      let snapshot = self.validator.refresh().await.map_err(failed)?;
      Ok(u32::try_from(snapshot.entries.len()).unwrap_or(u32::MAX))
   }

   async fn whitelist_status(&self) -> zbus::fdo::Result<String> {
      to_json(&self.validator.cache_info())
   }

   async fn my_devices(&self) -> zbus::fdo::Result<String> {
      let entries = self.validator.my_devices().await.map_err(failed)?;
      to_json(&entries)
   }

   async fn unbind(&self, mac: String) -> zbus::fdo::Result<bool> {
      let mac = MacAddress::parse(&mac)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Invalid MAC address: {mac}")))?;
      Ok(self.validator.unbind(&mac).await)
   }

   async fn set_exclusive_mode(&self, enabled: bool) -> zbus::fdo::Result<bool> {
      self.manager.set_exclusive_mode(enabled).await.map_err(failed)?;
      Ok(true)
   }

   async fn recent_captures(&self) -> zbus::fdo::Result<String> {
      to_json(&self.manager.recent_captures().await)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_found(emitter: &SignalEmitter<'_>, record: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn state_changed(
      emitter: &SignalEmitter<'_>,
      device_id: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, device_id: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(
      emitter: &SignalEmitter<'_>,
      device_id: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_failed(
      emitter: &SignalEmitter<'_>,
      device_id: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn telemetry(
      emitter: &SignalEmitter<'_>,
      device_id: &str,
      opcode: u8,
      arg1: u8,
      arg2: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn status_updated(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn foreign_capture(
      emitter: &SignalEmitter<'_>,
      device_id: &str,
      name: &str,
      message: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn link_state(&self) -> String {
      self
         .manager
         .session()
         .await
         .map(|s| s.state.to_string())
         .unwrap_or_default()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn params(entries: Vec<(&str, zvariant::Value<'static>)>) -> HashMap<String, zvariant::Value<'static>> {
      entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
   }

   #[test]
   fn test_parse_level_commands() {
      let p = params(vec![("value", zvariant::Value::from(40u32))]);
      assert_eq!(parse_command("volume", &p).ok(), Some(Command::Volume(40)));
      assert_eq!(parse_command("brightness", &p).ok(), Some(Command::Brightness(40)));

      let p = params(vec![("value", zvariant::Value::from(300i32))]);
      assert!(parse_command("volume", &p).is_err());
   }

   #[test]
   fn test_parse_mode_and_power() {
      let p = params(vec![("value", zvariant::Value::from("focus"))]);
      assert_eq!(parse_command("mode", &p).ok(), Some(Command::Mode(Mode::Focus)));

      let p = params(vec![("value", zvariant::Value::from(true))]);
      assert_eq!(parse_command("power", &p).ok(), Some(Command::Power(true)));
   }

   #[test]
   fn test_parse_raw_requires_all_bytes() {
      let p = params(vec![
         ("opcode", zvariant::Value::from(0x20u8)),
         ("arg1", zvariant::Value::from(1u8)),
      ]);
      assert!(parse_command("raw", &p).is_err());

      let mut p = p;
      p.insert("arg2".into(), zvariant::Value::from(2u8));
      assert_eq!(
         parse_command("raw", &p).ok(),
         Some(Command::Raw {
            opcode: 0x20,
            arg1: 1,
            arg2: 2
         })
      );
   }

   #[test]
   fn test_unknown_action_rejected() {
      assert!(parse_command("explode", &HashMap::new()).is_err());
   }
}
