//! Address classes: one pool, its lifetime bounds, the rules deciding which
//! clients may lease from it and the count of leases it currently backs.

use std::{
    fmt,
    net::Ipv6Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use compact_str::CompactString;
use dhcproto::v6::Message;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    clientclass::ClientClass,
    error::{ConfigError, PolicyError},
    hostrange::HostRange,
    lifetime::{LifetimeContract, Lifetimes},
    pool::AddressPool,
    Duid,
};

pub const DEFAULT_SHARE: u32 = 100;
/// Quota used when none is configured. Always clamped to the pool size.
pub const DEFAULT_CLASS_MAX_LEASE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out class identifiers. Owned by whoever loads configuration and kept
/// across reloads so an id is never reused within a process.
#[derive(Debug, Default)]
pub struct ClassIdAllocator {
    next: u64,
}

impl ClassIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> ClassId {
        let id = ClassId(self.next);
        self.next += 1;
        id
    }
}

/// Everything an address class needs, copied out of a parsed configuration
/// block with client class names already resolved.
#[derive(Debug, Clone)]
pub struct ClassParams {
    pub lifetimes: LifetimeContract,
    pub share: u32,
    pub class_max_lease: u64,
    pub pools: Vec<AddressPool>,
    pub reject_clients: Vec<HostRange>,
    pub accept_only: Vec<HostRange>,
    pub allow_client_classes: Vec<Arc<ClientClass>>,
    pub deny_client_classes: Vec<Arc<ClientClass>>,
}

impl Default for ClassParams {
    fn default() -> Self {
        Self {
            lifetimes: LifetimeContract::default(),
            share: DEFAULT_SHARE,
            class_max_lease: DEFAULT_CLASS_MAX_LEASE,
            pools: Vec::new(),
            reject_clients: Vec::new(),
            accept_only: Vec::new(),
            allow_client_classes: Vec::new(),
            deny_client_classes: Vec::new(),
        }
    }
}

/// Why a client was or was not found eligible, in evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    DeniedClientClass(CompactString),
    AllowedClientClass(CompactString),
    Rejected(String),
    Accepted(String),
    NotInAcceptList,
    NotInAllowList,
    Open,
}

impl Verdict {
    pub fn is_eligible(&self) -> bool {
        matches!(
            self,
            Verdict::AllowedClientClass(_) | Verdict::Accepted(_) | Verdict::Open
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::DeniedClientClass(name) => write!(f, "denied by client class {name}"),
            Verdict::AllowedClientClass(name) => write!(f, "allowed by client class {name}"),
            Verdict::Rejected(range) => write!(f, "rejected by {range}"),
            Verdict::Accepted(range) => write!(f, "accepted by {range}"),
            Verdict::NotInAcceptList => f.write_str("not in accept-only list"),
            Verdict::NotInAllowList => f.write_str("not in any allowed client class"),
            Verdict::Open => f.write_str("open class"),
        }
    }
}

#[derive(Debug)]
pub struct AddressClass {
    id: ClassId,
    share: u32,
    lifetimes: LifetimeContract,
    pool: AddressPool,
    class_max_lease: u64,
    reject: Vec<HostRange>,
    accept: Vec<HostRange>,
    allow: Vec<Arc<ClientClass>>,
    deny: Vec<Arc<ClientClass>>,
    assigned: AtomicU64,
}

impl AddressClass {
    /// Build and validate a class. `iface` only names the interface in
    /// errors and logs.
    pub fn new(id: ClassId, iface: &str, params: ClassParams) -> Result<Self, ConfigError> {
        let invalid = |reason: String| {
            error!(iface, class = %id, %reason, "invalid address class");
            ConfigError::InvalidClassConfiguration {
                iface: iface.into(),
                class: id,
                reason,
            }
        };

        let ClassParams {
            lifetimes,
            share,
            class_max_lease,
            mut pools,
            reject_clients,
            accept_only,
            allow_client_classes,
            deny_client_classes,
        } = params;

        let pool = pools
            .pop()
            .ok_or_else(|| invalid("no pool defined".into()))?;
        for ignored in &pools {
            warn!(iface, class = %id, %ignored, used = %pool, "two or more pools defined, only the last one is used");
        }

        lifetimes.validate().map_err(|reason| invalid(reason))?;
        if let Some(reason) = link_local_violation(&pool) {
            return Err(invalid(reason));
        }

        let pool_size = pool.range_size();
        let class_max_lease = if u128::from(class_max_lease) > pool_size {
            // pool_size < class_max_lease <= u64::MAX here
            pool_size as u64
        } else {
            class_max_lease
        };

        info!(
            iface,
            class = %id,
            %pool,
            share,
            class_max_lease,
            reject = reject_clients.len(),
            accept = accept_only.len(),
            allow = allow_client_classes.len(),
            deny = deny_client_classes.len(),
            "address class loaded"
        );

        Ok(Self {
            id,
            share,
            lifetimes,
            pool,
            class_max_lease,
            reject: reject_clients,
            accept: accept_only,
            allow: allow_client_classes,
            deny: deny_client_classes,
            assigned: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn share(&self) -> u32 {
        self.share
    }

    pub fn lifetimes(&self) -> &LifetimeContract {
        &self.lifetimes
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn class_max_lease(&self) -> u64 {
        self.class_max_lease
    }

    /// Run the eligibility rules in their fixed order; the first decisive
    /// rule wins.
    pub fn classify(
        &self,
        duid: &Duid,
        addr: Option<&Ipv6Addr>,
        msg: Option<&Message>,
    ) -> Verdict {
        if let Some(msg) = msg {
            if let Some(class) = self.deny.iter().find(|c| c.is_satisfied_by(msg)) {
                return Verdict::DeniedClientClass(class.name.clone());
            }
            if let Some(class) = self.allow.iter().find(|c| c.is_satisfied_by(msg)) {
                return Verdict::AllowedClientClass(class.name.clone());
            }
        }

        if let Some(range) = self.reject.iter().find(|r| r.matches(duid, addr)) {
            return Verdict::Rejected(range.to_string());
        }

        if !self.accept.is_empty() {
            return match self.accept.iter().find(|r| r.matches(duid, addr)) {
                Some(range) => Verdict::Accepted(range.to_string()),
                None => Verdict::NotInAcceptList,
            };
        }

        if !self.allow.is_empty() {
            return Verdict::NotInAllowList;
        }

        Verdict::Open
    }

    pub fn is_eligible(
        &self,
        duid: &Duid,
        addr: Option<&Ipv6Addr>,
        msg: Option<&Message>,
    ) -> bool {
        let verdict = self.classify(duid, addr, msg);
        debug!(class = %self.id, %duid, ?addr, %verdict, "eligibility");
        verdict.is_eligible()
    }

    /// Has the client been whitelisted by this class? Rejected clients never
    /// are, and a class without an accept-only list prefers nobody.
    pub fn is_preferred(&self, duid: &Duid, addr: Option<&Ipv6Addr>) -> bool {
        if self.reject.iter().any(|r| r.matches(duid, addr)) {
            return false;
        }
        self.accept.iter().any(|r| r.matches(duid, addr))
    }

    pub fn negotiate(&self, requested: &Lifetimes) -> Result<Lifetimes, PolicyError> {
        match self.lifetimes.negotiate(requested) {
            Ok(negotiated) => {
                debug!(class = %self.id, %requested, %negotiated, "negotiated lifetimes");
                Ok(negotiated)
            }
            Err(e) => {
                info!(class = %self.id, %requested, "refusing lease: {e}");
                Err(e)
            }
        }
    }

    pub fn addr_in_pool(&self, addr: &Ipv6Addr) -> bool {
        self.pool.contains(addr)
    }

    pub fn random_addr<R: Rng>(&self, rng: &mut R) -> Ipv6Addr {
        self.pool.draw(rng)
    }

    pub fn assigned_count(&self) -> u64 {
        self.assigned.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.assigned_count() < self.class_max_lease
    }

    /// Count `count` more leases against the quota. The check and the
    /// increment happen as one step, so concurrent admits cannot overshoot.
    pub fn admit(&self, count: u64) -> Result<u64, PolicyError> {
        let max = self.class_max_lease;
        match self
            .assigned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                n.checked_add(count).filter(|total| *total <= max)
            }) {
            Ok(prev) => {
                let total = prev + count;
                debug!(class = %self.id, assigned = total, class_max_lease = max, "admitted");
                Ok(total)
            }
            Err(current) => {
                debug!(class = %self.id, assigned = current, class_max_lease = max, "quota reached");
                Err(PolicyError::PoolExhausted)
            }
        }
    }

    /// Give back `count` leases. Releasing more than is assigned is a caller
    /// bug: it is logged and the count floors at zero.
    pub fn release(&self, count: u64) -> u64 {
        let mut underflow = false;
        let prev = self
            .assigned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                underflow = n < count;
                Some(n.saturating_sub(count))
            })
            .unwrap_or_else(|n| n);
        let total = prev.saturating_sub(count);
        if underflow {
            warn!(class = %self.id, assigned = prev, released = count, "lease count underflow, clamped to 0");
        } else {
            debug!(class = %self.id, assigned = total, "released");
        }
        total
    }

    pub fn snapshot(&self) -> ClassSnapshot {
        ClassSnapshot {
            id: self.id,
            share: self.share,
            lifetimes: self.lifetimes,
            pool: self.pool,
            pool_size: self.pool.range_size(),
            class_max_lease: self.class_max_lease,
            assigned: self.assigned_count(),
            reject_ranges: self.reject.len(),
            accept_ranges: self.accept.len(),
            allow_client_classes: self.allow.iter().map(|c| c.name.clone()).collect(),
            deny_client_classes: self.deny.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

/// Read-only view of a class for status dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassSnapshot {
    pub id: ClassId,
    pub share: u32,
    pub lifetimes: LifetimeContract,
    pub pool: AddressPool,
    pub pool_size: u128,
    pub class_max_lease: u64,
    pub assigned: u64,
    pub reject_ranges: usize,
    pub accept_ranges: usize,
    pub allow_client_classes: Vec<CompactString>,
    pub deny_client_classes: Vec<CompactString>,
}

/// A pool must not hand out link-local addresses.
fn link_local_violation(pool: &AddressPool) -> Option<String> {
    const FE80_LOW: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);
    const FE80_HIGH: Ipv6Addr =
        Ipv6Addr::new(0xfe80, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff);

    for addr in [FE80_LOW, FE80_HIGH] {
        if pool.contains(&addr) {
            return Some(format!("link local address {addr} belongs to the pool"));
        }
    }
    if pool.low().segments()[0] == 0xfe80 {
        return Some(format!("starting address {} is link-local", pool.low()));
    }
    if pool.high().segments()[0] == 0xfe80 {
        return Some(format!("ending address {} is link-local", pool.high()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clientclass::ClassRule, lifetime::Bounds};
    use dhcproto::v6::{DhcpOption, MessageType, VendorClass};

    const IFACE: &str = "eth0";

    fn duid_x() -> Duid {
        Duid::from(vec![0x00, 0x03, 0x00, 0x01, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01])
    }

    fn duid_y() -> Duid {
        Duid::from(vec![0x00, 0x03, 0x00, 0x01, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x02])
    }

    fn pool(s: &str) -> AddressPool {
        s.parse().unwrap()
    }

    fn params() -> ClassParams {
        ClassParams {
            pools: vec![pool("2001:db8::100-2001:db8::1ff")],
            ..Default::default()
        }
    }

    fn phones() -> Arc<ClientClass> {
        Arc::new(ClientClass {
            name: "phones".into(),
            rule: ClassRule::VendorClass {
                enterprise: 5678,
                contains: None,
            },
        })
    }

    fn phone_msg() -> Message {
        let mut msg = Message::new(MessageType::Solicit);
        msg.opts_mut().insert(DhcpOption::VendorClass(VendorClass {
            num: 5678,
            data: vec![b"phone".to_vec()],
        }));
        msg
    }

    fn plain_msg() -> Message {
        Message::new(MessageType::Solicit)
    }

    fn class(params: ClassParams) -> AddressClass {
        AddressClass::new(ClassId(1), IFACE, params).unwrap()
    }

    #[test]
    fn open_class_accepts_everyone() {
        let c = class(params());
        assert!(c.is_eligible(&duid_x(), None, None));
        assert!(c.is_eligible(&duid_x(), None, Some(&plain_msg())));
        assert!(!c.is_preferred(&duid_x(), None));
        assert_eq!(c.classify(&duid_x(), None, None), Verdict::Open);
    }

    #[test]
    fn rejected_duid_is_never_eligible() {
        let c = class(ClassParams {
            reject_clients: vec![HostRange::Duid(duid_x())],
            ..params()
        });
        for addr in [None, Some("2001:db8::150".parse().unwrap())] {
            assert!(!c.is_eligible(&duid_x(), addr.as_ref(), None));
            assert!(!c.is_eligible(&duid_x(), addr.as_ref(), Some(&plain_msg())));
        }
        assert!(c.is_eligible(&duid_y(), None, None));
    }

    #[test]
    fn accept_list_closes_the_class() {
        let c = class(ClassParams {
            accept_only: vec![HostRange::Duid(duid_x())],
            ..params()
        });
        assert!(c.is_eligible(&duid_x(), None, None));
        assert!(c.is_preferred(&duid_x(), None));
        assert!(!c.is_eligible(&duid_y(), None, None));
        assert!(!c.is_preferred(&duid_y(), None));
        assert_eq!(c.classify(&duid_y(), None, None), Verdict::NotInAcceptList);
    }

    #[test]
    fn reject_beats_accept() {
        let c = class(ClassParams {
            reject_clients: vec![HostRange::Prefix("2001:db8:bad::/48".parse().unwrap())],
            accept_only: vec![HostRange::Duid(duid_x())],
            ..params()
        });
        let bad: Ipv6Addr = "2001:db8:bad::1".parse().unwrap();
        assert!(!c.is_eligible(&duid_x(), Some(&bad), None));
        assert!(!c.is_preferred(&duid_x(), Some(&bad)));
        assert!(c.is_eligible(&duid_x(), None, None));
    }

    #[test]
    fn deny_client_class_beats_accept_range() {
        let c = class(ClassParams {
            accept_only: vec![HostRange::Duid(duid_x())],
            deny_client_classes: vec![phones()],
            ..params()
        });
        assert_eq!(
            c.classify(&duid_x(), None, Some(&phone_msg())),
            Verdict::DeniedClientClass("phones".into())
        );
        assert!(!c.is_eligible(&duid_x(), None, Some(&phone_msg())));
        assert!(c.is_eligible(&duid_x(), None, Some(&plain_msg())));
    }

    #[test]
    fn allow_client_class_short_circuits_reject() {
        let c = class(ClassParams {
            reject_clients: vec![HostRange::Duid(duid_x())],
            allow_client_classes: vec![phones()],
            ..params()
        });
        assert!(c.is_eligible(&duid_x(), None, Some(&phone_msg())));
        assert!(!c.is_eligible(&duid_x(), None, Some(&plain_msg())));
    }

    #[test]
    fn allow_list_closes_the_class() {
        let c = class(ClassParams {
            allow_client_classes: vec![phones()],
            ..params()
        });
        assert!(c.is_eligible(&duid_y(), None, Some(&phone_msg())));
        assert_eq!(
            c.classify(&duid_y(), None, Some(&plain_msg())),
            Verdict::NotInAllowList
        );
        // without a message no client class can match
        assert!(!c.is_eligible(&duid_y(), None, None));
    }

    #[test]
    fn accept_range_decides_before_allow_list() {
        let c = class(ClassParams {
            accept_only: vec![HostRange::Duid(duid_x())],
            allow_client_classes: vec![phones()],
            ..params()
        });
        assert!(c.is_eligible(&duid_x(), None, Some(&plain_msg())));
        assert!(!c.is_eligible(&duid_y(), None, Some(&plain_msg())));
        assert!(c.is_eligible(&duid_y(), None, Some(&phone_msg())));
    }

    #[test]
    fn quota_clamped_to_pool() {
        let c = class(ClassParams {
            pools: vec![pool("2001:db8::/124")],
            ..Default::default()
        });
        assert_eq!(c.class_max_lease(), 16);

        let c = class(ClassParams {
            pools: vec![pool("2001:db8::/124")],
            class_max_lease: 5,
            ..Default::default()
        });
        assert_eq!(c.class_max_lease(), 5);
    }

    #[test]
    fn last_pool_wins() {
        let c = class(ClassParams {
            pools: vec![pool("2001:db8:1::/120"), pool("2001:db8:2::/120")],
            ..Default::default()
        });
        assert_eq!(c.pool(), &pool("2001:db8:2::/120"));
        assert!(c.addr_in_pool(&"2001:db8:2::7".parse().unwrap()));
        assert!(!c.addr_in_pool(&"2001:db8:1::7".parse().unwrap()));
    }

    #[test]
    fn missing_pool_is_a_config_error() {
        let err = AddressClass::new(ClassId(3), IFACE, ClassParams::default()).unwrap_err();
        match err {
            ConfigError::InvalidClassConfiguration { iface, class, reason } => {
                assert_eq!(iface, IFACE);
                assert_eq!(class, ClassId(3));
                assert!(reason.contains("no pool"));
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn link_local_pools_are_rejected() {
        for p in ["fe80::/64", "fe80::1-fe80::ff", "fe00::-fe80::", "fe7f::-ff00::"] {
            let err = AddressClass::new(
                ClassId(1),
                IFACE,
                ClassParams {
                    pools: vec![pool(p)],
                    ..Default::default()
                },
            );
            assert!(
                matches!(err, Err(ConfigError::InvalidClassConfiguration { .. })),
                "{p}"
            );
        }
        assert!(link_local_violation(&pool("2001:db8::/64")).is_none());
    }

    #[test]
    fn contradictory_lifetimes_are_rejected() {
        let err = AddressClass::new(
            ClassId(9),
            IFACE,
            ClassParams {
                lifetimes: LifetimeContract {
                    preferred: Bounds::exactly(7200),
                    valid: Bounds::exactly(3600),
                    ..Default::default()
                },
                ..params()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("preferred <= valid"), "{err}");
    }

    #[test]
    fn ledger_respects_quota() {
        let c = class(ClassParams {
            pools: vec![pool("2001:db8::/124")],
            class_max_lease: 2,
            ..Default::default()
        });
        assert_eq!(c.admit(1), Ok(1));
        assert_eq!(c.admit(1), Ok(2));
        assert!(!c.has_capacity());
        assert_eq!(c.admit(1), Err(PolicyError::PoolExhausted));
        assert_eq!(c.assigned_count(), 2);
        assert_eq!(c.release(1), 1);
        assert!(c.has_capacity());
    }

    #[test]
    fn ledger_release_floors_at_zero() {
        let c = class(params());
        assert_eq!(c.release(1), 0);
        assert_eq!(c.admit(3), Ok(3));
        assert_eq!(c.release(5), 0);
        assert_eq!(c.assigned_count(), 0);
    }

    #[test]
    fn ledger_random_walk_stays_in_bounds() {
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;

        let c = class(ClassParams {
            class_max_lease: 7,
            ..params()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            if rng.random_bool(0.6) {
                let _ = c.admit(1);
            } else {
                c.release(1);
            }
            assert!(c.assigned_count() <= c.class_max_lease());
        }
    }

    #[test]
    fn concurrent_admits_never_overshoot() {
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;

        let c = Arc::new(class(ClassParams {
            class_max_lease: 5,
            ..params()
        }));
        let max = c.class_max_lease();

        let totals: Vec<(u64, u64)> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8u64)
                .map(|seed| {
                    let c = Arc::clone(&c);
                    s.spawn(move || {
                        let mut rng = ChaCha8Rng::seed_from_u64(seed);
                        let (mut admitted, mut released, mut held) = (0u64, 0u64, 0u64);
                        for _ in 0..5000 {
                            if held == 0 || rng.random_bool(0.5) {
                                if let Ok(total) = c.admit(1) {
                                    assert!(total <= max, "admit reported {total}");
                                    admitted += 1;
                                    held += 1;
                                }
                            } else {
                                c.release(1);
                                released += 1;
                                held -= 1;
                            }
                            assert!(c.assigned_count() <= max);
                        }
                        (admitted, released)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let net: u64 = totals.iter().map(|(a, r)| a - r).sum();
        assert_eq!(c.assigned_count(), net);
        assert!(net <= max);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut ids = ClassIdAllocator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_eq!(a, ClassId(0));
    }

    #[test]
    fn snapshot_reports_counts() {
        let c = class(ClassParams {
            reject_clients: vec![HostRange::Duid(duid_x())],
            accept_only: vec![HostRange::Duid(duid_y())],
            deny_client_classes: vec![phones()],
            class_max_lease: 10,
            ..params()
        });
        c.admit(4).unwrap();
        let snap = c.snapshot();
        assert_eq!(snap.id, ClassId(1));
        assert_eq!(snap.share, DEFAULT_SHARE);
        assert_eq!(snap.pool_size, 256);
        assert_eq!(snap.class_max_lease, 10);
        assert_eq!(snap.assigned, 4);
        assert_eq!(snap.reject_ranges, 1);
        assert_eq!(snap.accept_ranges, 1);
        assert_eq!(snap.deny_client_classes, vec![CompactString::from("phones")]);
        assert!(serde_json::to_string(&snap).is_ok());
    }
}
