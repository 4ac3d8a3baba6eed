use std::net::Ipv6Addr;

use dhcproto::v6::{DhcpOption, Message, IAAddr, IANA};

use crate::{lifetime::Lifetimes, Duid};

/// Helpers for interacting with dhcproto::v6::Message
pub trait PolicyMessageExtV6 {
    fn client_id(&self) -> Option<&[u8]>;
    fn client_duid(&self) -> Option<Duid>;
    fn ia_na(&self) -> Option<&IANA>;
    fn ia_na_addr(&self) -> Option<&IAAddr>;
    fn ia_na_address(&self) -> Option<Ipv6Addr>;
    fn requested_lifetimes(&self) -> Lifetimes;
}

impl PolicyMessageExtV6 for Message {
    /// Get the bytes representing the DUID
    fn client_id(&self) -> Option<&[u8]> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ClientId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    fn client_duid(&self) -> Option<Duid> {
        self.client_id().map(Duid::from)
    }

    fn ia_na(&self) -> Option<&IANA> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::IANA(iana) => Some(iana),
            _ => None,
        })
    }

    fn ia_na_addr(&self) -> Option<&IAAddr> {
        self.ia_na().and_then(|na| {
            na.opts.iter().find_map(|opt| match opt {
                DhcpOption::IAAddr(ia) => Some(ia),
                _ => None,
            })
        })
    }

    /// Address hint the client put in its first IA_NA, if any.
    fn ia_na_address(&self) -> Option<Ipv6Addr> {
        self.ia_na_addr()
            .map(|ia| ia.addr)
            .filter(|addr| !addr.is_unspecified())
    }

    /// Timers from the first IA_NA and lifetimes from its first address.
    /// Missing values are requested as 0, which lets the server choose.
    fn requested_lifetimes(&self) -> Lifetimes {
        let (t1, t2) = self.ia_na().map(|na| (na.t1, na.t2)).unwrap_or_default();
        let (preferred, valid) = self
            .ia_na_addr()
            .map(|ia| (ia.preferred_life, ia.valid_life))
            .unwrap_or_default();
        Lifetimes::new(t1, t2, preferred, valid)
    }
}
