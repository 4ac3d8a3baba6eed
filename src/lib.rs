use std::fmt;

use compact_str::{CompactString, ToCompactString};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod addrclass;
pub mod clientclass;
pub mod config;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod hostrange;
pub mod leasedb;
pub mod lifetime;
pub mod logging;
pub mod mgmt;
pub mod pool;
pub mod selector;
#[cfg(unix)]
pub mod signal;

pub use addrclass::{AddressClass, ClassId, ClassSnapshot};
pub use engine::{ClientRequest, PolicyEngine};
pub use error::{ConfigError, PolicyError};
pub use lifetime::{Bounds, LifetimeContract, Lifetimes, INFINITY};

/// DHCP Unique Identifier as carried in the Client Identifier option.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duid {
    pub bytes: Vec<u8>,
}

impl Duid {
    /// Format as lowercase hex octets separated by `:`, the form used in
    /// configuration files and logs.
    pub fn to_colon_string(&self) -> CompactString {
        let mut out = CompactString::with_capacity(self.bytes.len() * 3);
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Parse `00:01:02`, `00-01-02` or `000102`.
    pub fn parse(s: &str) -> Option<Self> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.is_empty() || hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some(Self { bytes })
    }
}

impl From<Vec<u8>> for Duid {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<&[u8]> for Duid {
    fn from(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_colon_string())
    }
}

impl Serialize for Duid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_colon_string())
    }
}

impl<'de> Deserialize<'de> for Duid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = CompactString::deserialize(deserializer)?;
        Duid::parse(&s).ok_or_else(|| {
            de::Error::custom(format!("invalid duid `{}`", s.to_compact_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duid_colon_string() {
        let duid = Duid::from(vec![0x00, 0x01, 0xab, 0xff]);
        assert_eq!(duid.to_colon_string(), "00:01:ab:ff");
        assert_eq!(Duid::parse("00:01:ab:ff"), Some(duid.clone()));
        assert_eq!(Duid::parse("00-01-AB-FF"), Some(duid.clone()));
        assert_eq!(Duid::parse("0001abff"), Some(duid));
    }

    #[test]
    fn duid_rejects_garbage() {
        assert_eq!(Duid::parse(""), None);
        assert_eq!(Duid::parse("0"), None);
        assert_eq!(Duid::parse("zz:01"), None);
    }

    #[test]
    fn duid_json() {
        let duid: Duid = serde_json::from_str(r#""00:11:22:33:44:55:66""#).unwrap();
        assert_eq!(duid.bytes, vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(
            serde_json::to_string(&duid).unwrap(),
            r#""00:11:22:33:44:55:66""#
        );
    }
}
