//! Identity and address predicates used by `reject_clients` and
//! `accept_only` lists.

use std::{fmt, net::Ipv6Addr};

use advmac::MacAddr6;
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{pool::AddressPool, Duid};

/// DUID type codes from RFC 8415.
const DUID_LLT: u16 = 1; // Link-layer address plus time
const DUID_LL: u16 = 3; // Link-layer address

/// Hardware type for Ethernet from IANA.
const HTYPE_ETHERNET: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRange {
    /// Exactly this DUID.
    Duid(Duid),
    /// Any DUID ordered bytewise between the two, inclusive.
    DuidRange { from: Duid, to: Duid },
    /// DUID-LLT or DUID-LL carrying this Ethernet address.
    Mac(MacAddr6),
    Address(Ipv6Addr),
    AddressRange(AddressPool),
    Prefix(Ipv6Net),
}

impl HostRange {
    /// Does the client fall into this range? Identifier ranges ignore the
    /// address, address ranges ignore the identifier and never match a
    /// client without an address.
    pub fn matches(&self, duid: &Duid, addr: Option<&Ipv6Addr>) -> bool {
        let hit = match self {
            HostRange::Duid(d) => d == duid,
            HostRange::DuidRange { from, to } => {
                from.bytes.as_slice() <= duid.bytes.as_slice()
                    && duid.bytes.as_slice() <= to.bytes.as_slice()
            }
            HostRange::Mac(mac) => duid_mac(duid).is_some_and(|m| m == *mac),
            HostRange::Address(a) => addr.is_some_and(|addr| addr == a),
            HostRange::AddressRange(range) => addr.is_some_and(|addr| range.contains(addr)),
            HostRange::Prefix(net) => addr.is_some_and(|addr| net.contains(addr)),
        };
        trace!(range = %self, %duid, ?addr, hit, "host range test");
        hit
    }
}

impl fmt::Display for HostRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRange::Duid(d) => write!(f, "duid {d}"),
            HostRange::DuidRange { from, to } => write!(f, "duid {from}..{to}"),
            HostRange::Mac(mac) => write!(f, "mac {mac}"),
            HostRange::Address(a) => write!(f, "address {a}"),
            HostRange::AddressRange(range) => write!(f, "addresses {range}"),
            HostRange::Prefix(net) => write!(f, "prefix {net}"),
        }
    }
}

/// Extract the Ethernet address from a DUID-LLT or DUID-LL.
///
/// DUID-LLT format: type(2) + htype(2) + time(4) + link-layer(variable)
/// DUID-LL format:  type(2) + htype(2) + link-layer(variable)
pub fn duid_mac(duid: &Duid) -> Option<MacAddr6> {
    let bytes = duid.bytes.as_slice();
    if bytes.len() < 4 {
        return None;
    }

    let duid_type = u16::from_be_bytes([bytes[0], bytes[1]]);
    let htype = u16::from_be_bytes([bytes[2], bytes[3]]);
    if htype != HTYPE_ETHERNET {
        return None;
    }

    let offset = match duid_type {
        DUID_LLT => 8,
        DUID_LL => 4,
        _ => return None,
    };
    let mac: [u8; 6] = bytes.get(offset..offset + 6)?.try_into().ok()?;
    Some(MacAddr6::new(mac))
}
