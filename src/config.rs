//! `config.json`: global client classes plus the address classes of every
//! interface.

use std::{fs::File, path::Path, sync::Arc};

use compact_str::CompactString;
use serde::{de, Deserialize, Deserializer};
use tracing::{info, Level};

use crate::{
    addrclass::{AddressClass, ClassIdAllocator, ClassParams, DEFAULT_CLASS_MAX_LEASE, DEFAULT_SHARE},
    clientclass::{ClientClass, ClientClassTable},
    engine::{ClassTable, InterfaceClasses},
    error::ConfigError,
    hostrange::HostRange,
    lifetime::{Bounds, LifetimeContract, INFINITY},
    pool::AddressPool,
};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: CompactString,
    #[serde(default)]
    pub client_classes: Vec<ClientClass>,
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceConfig {
    pub name: CompactString,
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ClassConfig {
    #[serde(default)]
    pub t1: BoundsConfig,
    #[serde(default)]
    pub t2: BoundsConfig,
    #[serde(default)]
    pub preferred: BoundsConfig,
    #[serde(default)]
    pub valid: BoundsConfig,
    #[serde(default = "default_share")]
    pub share: u32,
    #[serde(default = "default_class_max_lease")]
    pub class_max_lease: u64,
    #[serde(default)]
    pub pools: Vec<AddressPool>,
    #[serde(default)]
    pub reject_clients: Vec<HostRange>,
    #[serde(default)]
    pub accept_only: Vec<HostRange>,
    #[serde(default)]
    pub allow_client_classes: Vec<CompactString>,
    #[serde(default)]
    pub deny_client_classes: Vec<CompactString>,
}

/// `{"min": 300, "max": "infinity"}`. A missing `min` is 0, a missing `max`
/// is infinity.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BoundsConfig {
    #[serde(default, deserialize_with = "lifetime")]
    pub min: u32,
    #[serde(default = "infinity", deserialize_with = "lifetime")]
    pub max: u32,
}

impl Default for BoundsConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: INFINITY,
        }
    }
}

impl From<BoundsConfig> for Bounds {
    fn from(b: BoundsConfig) -> Self {
        Bounds::new(b.min, b.max)
    }
}

fn default_log_level() -> CompactString {
    "info".into()
}

fn default_share() -> u32 {
    DEFAULT_SHARE
}

fn default_class_max_lease() -> u64 {
    DEFAULT_CLASS_MAX_LEASE
}

fn infinity() -> u32 {
    INFINITY
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LifetimeValue {
    Seconds(u32),
    Keyword(CompactString),
}

fn lifetime<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match LifetimeValue::deserialize(deserializer)? {
        LifetimeValue::Seconds(secs) => Ok(secs),
        LifetimeValue::Keyword(k) if k.eq_ignore_ascii_case("infinity") => Ok(INFINITY),
        LifetimeValue::Keyword(k) => Err(de::Error::custom(format!(
            "expected seconds or \"infinity\", got `{k}`"
        ))),
    }
}

impl Config {
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let file = File::open(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn log_level(&self) -> Option<Level> {
        self.log_level.parse().ok()
    }

    /// Build every interface's address classes. Ids come from `ids`, which
    /// the caller keeps across reloads. Any invalid class fails the whole
    /// table, so no interface is served from a partial configuration.
    pub fn build(&self, ids: &mut ClassIdAllocator) -> Result<ClassTable, ConfigError> {
        let client_classes = ClientClassTable::new(self.client_classes.clone());
        let mut interfaces = Vec::with_capacity(self.interfaces.len());

        for iface in &self.interfaces {
            let mut classes = Vec::with_capacity(iface.classes.len());
            for class in &iface.classes {
                let params = class.to_params(&client_classes);
                classes.push(Arc::new(AddressClass::new(ids.next_id(), &iface.name, params)?));
            }
            info!(iface = %iface.name, classes = classes.len(), "interface loaded");
            interfaces.push(InterfaceClasses {
                name: iface.name.clone(),
                classes,
            });
        }

        ClassTable::new(interfaces)
    }
}

impl ClassConfig {
    fn to_params(&self, client_classes: &ClientClassTable) -> ClassParams {
        ClassParams {
            lifetimes: LifetimeContract {
                t1: self.t1.into(),
                t2: self.t2.into(),
                preferred: self.preferred.into(),
                valid: self.valid.into(),
            },
            share: self.share,
            class_max_lease: self.class_max_lease,
            pools: self.pools.clone(),
            reject_clients: self.reject_clients.clone(),
            accept_only: self.accept_only.clone(),
            allow_client_classes: client_classes.resolve(&self.allow_client_classes),
            deny_client_classes: client_classes.resolve(&self.deny_client_classes),
        }
    }
}

/// Read and build in one step, as done at startup and on reload.
pub fn load_table(config_dir: &Path, ids: &mut ClassIdAllocator) -> Result<ClassTable, ConfigError> {
    Config::load(config_dir)?.build(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrclass::ClassId;

    const CONFIG: &str = r#"{
        "log_level": "debug",
        "client_classes": [
            {"name": "phones", "rule": {"vendor_class": {"enterprise": 5678, "contains": "phone"}}}
        ],
        "interfaces": [
            {"name": "eth0", "classes": [
                {
                    "t1": {"min": 300, "max": 1000},
                    "t2": {"min": 500, "max": 2000},
                    "preferred": {"min": 1000, "max": 3600},
                    "valid": {"min": 2000, "max": "infinity"},
                    "share": 300,
                    "class_max_lease": 50,
                    "pools": ["2001:db8:1::/64", "2001:db8::10-2001:db8::ff"],
                    "allow_client_classes": ["phones", "laptops"]
                },
                {
                    "pools": ["2001:db8:2::/120"],
                    "reject_clients": [{"duid": "00:03:00:01:00:11:22:33:44:55"}],
                    "deny_client_classes": ["phones"]
                }
            ]},
            {"name": "eth1", "classes": [
                {"pools": ["2001:db8:3::1-2001:db8:3::4"]}
            ]}
        ]
    }"#;

    fn build(json: &str) -> Result<ClassTable, ConfigError> {
        let config: Config = serde_json::from_str(json).unwrap();
        config.build(&mut ClassIdAllocator::new())
    }

    #[test]
    fn full_config() {
        let config: Config = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(config.log_level(), Some(Level::DEBUG));
        let table = config.build(&mut ClassIdAllocator::new()).unwrap();

        assert_eq!(table.class_count(), 3);
        let eth0 = table.interface("eth0").unwrap();
        assert_eq!(eth0.classes.len(), 2);

        let first = &eth0.classes[0];
        assert_eq!(first.id(), ClassId(0));
        assert_eq!(first.share(), 300);
        assert_eq!(first.class_max_lease(), 50);
        // last pool wins
        assert_eq!(first.pool().to_string(), "2001:db8::10-2001:db8::ff");
        assert_eq!(first.lifetimes().valid, Bounds::new(2000, INFINITY));
        // unknown client class names are dropped
        assert_eq!(first.snapshot().allow_client_classes, vec!["phones"]);

        let second = &eth0.classes[1];
        assert_eq!(second.share(), DEFAULT_SHARE);
        assert_eq!(second.lifetimes(), &LifetimeContract::default());
        // quota clamped to pool size
        assert_eq!(second.class_max_lease(), 256);

        let eth1 = table.interface("eth1").unwrap();
        assert_eq!(eth1.classes[0].class_max_lease(), 4);
        assert_eq!(table.interface_of(ClassId(2)), Some("eth1"));
    }

    #[test]
    fn ids_continue_across_builds() {
        let config: Config = serde_json::from_str(CONFIG).unwrap();
        let mut ids = ClassIdAllocator::new();
        config.build(&mut ids).unwrap();
        let again = config.build(&mut ids).unwrap();
        let eth0 = again.interface("eth0").unwrap();
        assert_eq!(eth0.classes[0].id(), ClassId(3));
    }

    #[test]
    fn infinity_keyword() {
        let b: BoundsConfig = serde_json::from_str(r#"{"min": "INFINITY"}"#).unwrap();
        assert_eq!(Bounds::from(b), Bounds::new(INFINITY, INFINITY));
        let b: BoundsConfig = serde_json::from_str("{}").unwrap();
        assert!(Bounds::from(b).is_unbounded());
        assert!(serde_json::from_str::<BoundsConfig>(r#"{"max": "forever"}"#).is_err());
    }

    #[test]
    fn class_without_pool() {
        let err = build(r#"{"interfaces": [{"name": "eth0", "classes": [{"share": 5}]}]}"#)
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidClassConfiguration { ref reason, .. } if reason == "no pool defined"),
            "{err}"
        );
    }

    #[test]
    fn one_bad_interface_fails_the_table() {
        let err = build(
            r#"{"interfaces": [
                {"name": "eth0", "classes": [{"pools": ["2001:db8::/120"]}]},
                {"name": "eth1", "classes": [{"pools": ["fe80::1-fe80::ff"]}]}
            ]}"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidClassConfiguration { ref iface, .. } if iface.as_str() == "eth1"),
            "{err}"
        );
    }

    #[test]
    fn inverted_bounds() {
        let err = build(
            r#"{"interfaces": [{"name": "eth0", "classes": [
                {"pools": ["2001:db8::/120"], "t1": {"min": 900, "max": 100}}
            ]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClassConfiguration { .. }), "{err}");
    }

    #[test]
    fn link_local_pool() {
        let err = build(
            r#"{"interfaces": [{"name": "eth0", "classes": [{"pools": ["fe80::/64"]}]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidClassConfiguration { .. }), "{err}");
    }

    #[test]
    fn duplicate_interface() {
        let err = build(
            r#"{"interfaces": [
                {"name": "eth0", "classes": [{"pools": ["2001:db8::/120"]}]},
                {"name": "eth0", "classes": [{"pools": ["2001:db8:1::/120"]}]}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateInterface(ref name) if name.as_str() == "eth0"));
    }

    #[test]
    fn missing_file() {
        let err = Config::load(Path::new("/nonexistent/classdhcp6")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_json() {
        let err = serde_json::from_str::<Config>(r#"{"interfaces": 5}"#).unwrap_err();
        assert!(ConfigError::from(err).to_string().starts_with("failed to parse"));
    }
}
