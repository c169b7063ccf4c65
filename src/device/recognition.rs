//! Identity recognition for advertising devices.
//!
//! Cheap accessories often advertise without a platform-visible name. This
//! module recovers a usable display name from the raw advertisement payload,
//! the MAC vendor prefix or the Bluetooth class of device, and classifies
//! candidates for the scanner's advisory filters.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::{SmolStr, format_smolstr};
use uuid::Uuid;

/// AD type: shortened local name.
const AD_SHORT_NAME: u8 = 0x08;
/// AD type: complete local name.
const AD_COMPLETE_NAME: u8 = 0x09;

/// Name fragments hinting at audio gear (case-insensitive).
const AUDIO_NAME_KEYWORDS: &[&str] = &[
   "headphone",
   "earphone",
   "headset",
   "earbuds",
   "buds",
   "tws",
   "audio",
   "sound",
   "music",
   "speaker",
   "bt-",
];

/// Naming convention of the supported accessories (case-insensitive prefix).
const NAME_CONVENTION_PREFIXES: &[&str] = &["bt-", "medsleep", "edifier"];

/// Names platforms report for devices they could not name.
const PLACEHOLDER_NAMES: &[&str] = &["unknown", "unknown device", "n/a"];

/// Expands a 16-bit SIG id onto the Bluetooth base UUID.
pub const fn base_uuid(short: u32) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Vendor service ids common on accessory audio firmware.
pub static COMMON_AUDIO_SERVICES: [Uuid; 6] = [
   base_uuid(0xFFF0),
   base_uuid(0x9300),
   base_uuid(0x180F),
   base_uuid(0x180A),
   base_uuid(0xFFE0),
   Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e), // Nordic UART
];

/// Classic audio profiles (A2DP sink, AVRCP, HFP, A2DP source, AVRCP target).
static AUDIO_PROFILES: [Uuid; 5] = [
   base_uuid(0x110B),
   base_uuid(0x110E),
   base_uuid(0x111E),
   base_uuid(0x110A),
   base_uuid(0x110C),
];

/// MAC OUI -> vendor.
const OUI_VENDORS: &[([u8; 3], &str)] = &[
   ([0x00, 0x0D, 0x44], "Alps Electric"),
   ([0x00, 0x12, 0xEE], "Sony"),
   ([0x00, 0x13, 0xE0], "Murata"),
   ([0x00, 0x15, 0x83], "Huawei"),
   ([0x00, 0x16, 0xBC], "Sony"),
   ([0x00, 0x18, 0x16], "Sony"),
   ([0x00, 0x18, 0x82], "Huawei"),
   ([0x00, 0x1A, 0x7D], "Xiaomi"),
   ([0x00, 0x1D, 0xBA], "Sony"),
   ([0x00, 0x1E, 0x10], "Huawei"),
   ([0x00, 0x21, 0xCC], "Apple"),
   ([0x00, 0x23, 0x6C], "Apple"),
   ([0x00, 0x24, 0xBE], "Sony"),
   ([0x00, 0x25, 0x68], "Huawei"),
   ([0x00, 0x25, 0xBC], "Apple"),
   ([0x00, 0x26, 0x4A], "Apple"),
   ([0x04, 0x0C, 0xCE], "Apple"),
   ([0x04, 0x52, 0xF3], "Apple"),
   ([0x14, 0xF6, 0x5A], "Xiaomi"),
   ([0x28, 0x6C, 0x07], "Xiaomi"),
   ([0x30, 0x17, 0xC8], "Sony"),
   ([0x3C, 0xBD, 0xD8], "Xiaomi"),
   ([0x70, 0x73, 0xCB], "Apple"),
   ([0x7C, 0x1D, 0xD9], "Xiaomi"),
   ([0x8C, 0xBE, 0xBE], "Xiaomi"),
   ([0xA4, 0xC3, 0x61], "Apple"),
   ([0xF8, 0xA4, 0x5F], "Xiaomi"),
   ([0xFC, 0xA3, 0x86], "Amazon"),
];

/// Best-effort normalized 6-octet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
   pub const ZERO: Self = Self([0; 6]);

   /// Parses any spelling with exactly 12 hex digits, ignoring separators.
   pub fn parse(s: &str) -> Option<Self> {
      let digits: Vec<u8> = s
         .bytes()
         .filter(u8::is_ascii_hexdigit)
         .collect();
      if digits.len() != 12 {
         return None;
      }
      let mut out = [0u8; 6];
      hex::decode_to_slice(&digits, &mut out).ok()?;
      Some(Self(out))
   }

   /// Derives the address from a transport id when the id embeds one.
   pub fn from_device_id(id: &str) -> Option<Self> {
      // `dev_AA_BB_CC_DD_EE_FF` object paths and plain addresses both qualify
      let tail = id.rsplit('/').next().unwrap_or(id);
      let tail = tail.strip_prefix("dev_").unwrap_or(tail);
      Self::parse(tail)
   }

   pub fn is_zero(&self) -> bool {
      *self == Self::ZERO
   }

   pub fn oui(&self) -> [u8; 3] {
      [self.0[0], self.0[1], self.0[2]]
   }
}

impl fmt::Display for MacAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
   }
}

impl FromStr for MacAddress {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      Self::parse(s).ok_or(strum::ParseError::VariantNotFound)
   }
}

impl Serialize for MacAddress {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.collect_str(self)
   }
}

impl<'de> Deserialize<'de> for MacAddress {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      let s = SmolStr::deserialize(deserializer)?;
      Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid MAC address: {s}")))
   }
}

/// Extracts the local name from a raw advertisement payload (AD structures,
/// `[len, type, data..]`). A complete name wins over a shortened one.
pub fn parse_advertised_name(payload: &[u8]) -> Option<SmolStr> {
   let mut short = None;
   let mut rest = payload;
   while let [len, tail @ ..] = rest {
      let len = usize::from(*len);
      if len == 0 || len > tail.len() {
         break;
      }
      let (record, next) = tail.split_at(len);
      rest = next;
      let (kind, data) = (record[0], &record[1..]);
      let name = String::from_utf8_lossy(data);
      let name = name.trim_end_matches('\0').trim();
      if name.is_empty() {
         continue;
      }
      match kind {
         AD_COMPLETE_NAME => return Some(SmolStr::new(name)),
         AD_SHORT_NAME if short.is_none() => short = Some(SmolStr::new(name)),
         _ => {},
      }
   }
   short
}

pub fn vendor_for(mac: &MacAddress) -> Option<&'static str> {
   let oui = mac.oui();
   OUI_VENDORS
      .binary_search_by(|(prefix, _)| prefix.cmp(&oui))
      .ok()
      .map(|i| OUI_VENDORS[i].1)
}

/// Text for a Bluetooth class of device.
pub fn class_description(class: u32) -> Option<&'static str> {
   let major = (class & 0x1F00) >> 8;
   let minor = (class & 0xFC) >> 2;
   let text = match major {
      0x04 => match minor {
         0x06 => "Headphones",
         0x05 => "Speaker",
         _ => "Audio device",
      },
      0x01 => "Computer",
      0x02 => "Phone",
      0x03 => "Network device",
      0x05 => "Peripheral",
      0x06 => "Imaging device",
      0x07 => "Wearable",
      0x08 => "Toy",
      0x09 => "Health device",
      _ => return None,
   };
   Some(text)
}

/// True when a reported name carries no information.
pub fn is_placeholder_name(name: &str) -> bool {
   let name = name.trim();
   name.is_empty() || PLACEHOLDER_NAMES.iter().any(|p| name.eq_ignore_ascii_case(p))
}

/// Resolves a display name, first successful source wins: platform name,
/// advertisement payload, vendor prefix, class of device.
pub fn resolve_name(
   platform_name: Option<&str>,
   payload: &[u8],
   mac: Option<&MacAddress>,
   class: Option<u32>,
) -> Option<SmolStr> {
   if let Some(name) = platform_name
      && !is_placeholder_name(name)
   {
      return Some(SmolStr::new(name.trim()));
   }
   if let Some(name) = parse_advertised_name(payload) {
      log::debug!("Name recovered from advertisement payload: {name}");
      return Some(name);
   }
   if let Some(vendor) = mac.and_then(vendor_for) {
      return Some(format_smolstr!("{vendor} device"));
   }
   class.and_then(class_description).map(SmolStr::new_static)
}

/// Audio-class pre-filter: class of device, advertised profiles or name.
pub fn looks_like_audio(name: &str, services: &[Uuid], class: Option<u32>) -> bool {
   if let Some(class) = class
      && (class & 0x1F00) >> 8 == 0x04
   {
      return true;
   }
   if services
      .iter()
      .any(|s| AUDIO_PROFILES.contains(s) || COMMON_AUDIO_SERVICES.contains(s))
   {
      return true;
   }
   let name = name.to_ascii_lowercase();
   AUDIO_NAME_KEYWORDS.iter().any(|k| name.contains(k))
}

/// Name-prefix pre-filter.
pub fn follows_name_convention(name: &str) -> bool {
   let name = name.to_ascii_lowercase();
   NAME_CONVENTION_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_mac_parsing() {
      let mac = MacAddress::parse("11:29:aa:25:4a:58").unwrap();
      assert_eq!(mac.to_string(), "11:29:AA:25:4A:58");
      assert_eq!(MacAddress::parse("1129-AA25-4A58"), Some(mac));
      assert!(MacAddress::parse("11:29:AA").is_none());
      assert!(MacAddress::parse("00:00:00:00:00:00").unwrap().is_zero());
      assert_eq!(
         MacAddress::from_device_id("/org/bluez/hci0/dev_11_29_AA_25_4A_58"),
         Some(mac)
      );
      assert!(MacAddress::from_device_id("6F1C2B0A-9C1D-4E3F-A1B2-C3D4E5F60718").is_none());
   }

   #[test]
   fn test_short_name_from_payload() {
      // flags, then shortened local name "BT-Music"
      let mut payload = vec![0x02, 0x01, 0x06, 0x09, AD_SHORT_NAME];
      payload.extend_from_slice(b"BT-Music");
      assert_eq!(
         resolve_name(Some(""), &payload, None, None).as_deref(),
         Some("BT-Music")
      );
   }

   #[test]
   fn test_complete_name_wins_and_garbage_is_tolerated() {
      let mut payload = vec![0x04, AD_SHORT_NAME, b'B', b'T', b'-'];
      payload.extend_from_slice(&[0x06, AD_COMPLETE_NAME]);
      payload.extend_from_slice(b"Sleep");
      payload.extend_from_slice(&[0x30, 0xFF]); // length overruns the buffer
      assert_eq!(parse_advertised_name(&payload).as_deref(), Some("Sleep"));
      assert_eq!(parse_advertised_name(&[0x00, 0x09]), None);
   }

   #[test]
   fn test_name_source_order() {
      let sony = MacAddress::parse("00:12:EE:01:02:03").unwrap();
      assert_eq!(
         resolve_name(Some("Pillow"), &[], Some(&sony), Some(0x200418)).as_deref(),
         Some("Pillow")
      );
      assert_eq!(
         resolve_name(Some("unknown"), &[], Some(&sony), Some(0x200418)).as_deref(),
         Some("Sony device")
      );
      let unknown_vendor = MacAddress::parse("02:00:00:01:02:03").unwrap();
      assert_eq!(
         resolve_name(None, &[], Some(&unknown_vendor), Some(0x200418)).as_deref(),
         Some("Headphones")
      );
      assert_eq!(resolve_name(None, &[], Some(&unknown_vendor), None), None);
   }

   #[test]
   fn test_vendor_table_is_sorted() {
      assert!(OUI_VENDORS.windows(2).all(|w| w[0].0 < w[1].0));
   }

   #[test]
   fn test_prefilters() {
      assert!(looks_like_audio("", &[], Some(0x200404)));
      assert!(looks_like_audio("", &[base_uuid(0x110B)], None));
      assert!(looks_like_audio("My Earbuds", &[], None));
      assert!(!looks_like_audio("Thermostat", &[], Some(0x000104)));
      assert!(follows_name_convention("BT-Sound"));
      assert!(follows_name_convention("MedSleep Pro"));
      assert!(!follows_name_convention("Sleep BT-"));
   }
}
