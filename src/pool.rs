use std::{fmt, net::Ipv6Addr, str::FromStr};

use ipnet::Ipv6Net;
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Inclusive range of IPv6 addresses an address class leases from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPool {
    low: Ipv6Addr,
    high: Ipv6Addr,
}

impl AddressPool {
    /// Build a pool from two endpoints in either order.
    pub fn new(a: Ipv6Addr, b: Ipv6Addr) -> Self {
        if u128::from(a) <= u128::from(b) {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> Ipv6Addr {
        self.low
    }

    pub fn high(&self) -> Ipv6Addr {
        self.high
    }

    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        let addr = u128::from(*addr);
        addr >= u128::from(self.low) && addr <= u128::from(self.high)
    }

    /// Number of addresses in the pool. The whole address space holds 2^128,
    /// which does not fit: `::/0` reports `u128::MAX`, one short.
    pub fn range_size(&self) -> u128 {
        (u128::from(self.high) - u128::from(self.low)).saturating_add(1)
    }

    /// Uniformly pick an address from the pool. Whether the address is
    /// already leased is for the caller to check.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> Ipv6Addr {
        let span = u128::from(self.high) - u128::from(self.low);
        let offset = rng.random_range(0..=span);
        Ipv6Addr::from(u128::from(self.low) + offset)
    }
}

impl From<Ipv6Net> for AddressPool {
    fn from(net: Ipv6Net) -> Self {
        Self {
            low: net.network(),
            high: net.broadcast(),
        }
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl FromStr for AddressPool {
    type Err = String;

    /// Accepts `low-high` or a CIDR prefix such as `2001:db8::/120`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((low, high)) = s.split_once('-') {
            let low: Ipv6Addr = low
                .trim()
                .parse()
                .map_err(|e| format!("bad pool start `{low}`: {e}"))?;
            let high: Ipv6Addr = high
                .trim()
                .parse()
                .map_err(|e| format!("bad pool end `{high}`: {e}"))?;
            return Ok(Self::new(low, high));
        }
        s.parse::<Ipv6Net>()
            .map(|net| net.trunc().into())
            .map_err(|e| format!("bad pool `{s}`: {e}"))
    }
}

impl Serialize for AddressPool {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressPool {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
