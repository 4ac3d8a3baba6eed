use std::net::Ipv6Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use compact_str::CompactString;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::{
    addrclass::ClassId,
    engine::{ClassTable, ClientRequest, PolicyEngine},
    error::PolicyError,
    lifetime::{Lifetimes, INFINITY},
    Duid,
};

/// Draws from a pool before giving up on finding a free address.
pub const MAX_DRAW_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct Lease {
    pub duid: Duid,
    pub iface: CompactString,
    pub class: ClassId,
    pub lifetimes: Lifetimes,
    pub first_leased: Instant,
    pub last_leased: Instant,
}

impl Lease {
    /// `None` for an infinite valid lifetime.
    pub fn valid(&self) -> Option<Duration> {
        (self.lifetimes.valid != INFINITY).then(|| Duration::from_secs(self.lifetimes.valid.into()))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.valid()
            .is_some_and(|valid| now.duration_since(self.last_leased) >= valid)
    }
}

/// Addresses currently leased, each counted once in its class's ledger.
#[derive(Default)]
pub struct LeaseDb {
    leases: DashMap<Ipv6Addr, Lease>,
    /// Address each client holds per class. Always locked before `leases`.
    by_client: DashMap<(Duid, ClassId), Ipv6Addr>,
    /// Shared while leases are counted against the engine's table, exclusive
    /// while the table is replaced.
    table_gate: RwLock<()>,
}

impl LeaseDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.table_gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn get(&self, addr: &Ipv6Addr) -> Option<Lease> {
        self.leases.get(addr).map(|l| l.clone())
    }

    /// Address held by `duid` in `class`, if any.
    pub fn by_duid(&self, duid: &Duid, class: ClassId) -> Option<Ipv6Addr> {
        self.by_client.get(&(duid.clone(), class)).map(|addr| *addr)
    }

    pub fn lease(
        &self,
        engine: &PolicyEngine,
        class: ClassId,
        req: &ClientRequest,
        lifetimes: Lifetimes,
    ) -> Result<Ipv6Addr, PolicyError> {
        self.lease_with(engine, class, req, lifetimes, &mut rand::rng())
    }

    /// Lease an address from `class` to the client.
    ///
    /// A client already holding an address in the class gets the same one
    /// back with its timers refreshed. Otherwise the class admits one more
    /// lease and the client's hinted address is used when it is free and in
    /// the pool, else the pool is drawn from until a free address turns up.
    ///
    /// The client's index slot stays locked for the whole call, so two
    /// requests from one client cannot both admit.
    #[instrument(skip(self, engine, req, rng), fields(duid = %req.duid))]
    pub fn lease_with<R: Rng>(
        &self,
        engine: &PolicyEngine,
        class: ClassId,
        req: &ClientRequest,
        lifetimes: Lifetimes,
        rng: &mut R,
    ) -> Result<Ipv6Addr, PolicyError> {
        let _shared = self.shared();
        let index = self.by_client.entry((req.duid.clone(), class));

        if let Entry::Occupied(held) = &index {
            let addr = *held.get();
            if let Some(mut lease) = self.leases.get_mut(&addr) {
                if lease.duid == req.duid && lease.class == class {
                    lease.last_leased = Instant::now();
                    lease.lifetimes = lifetimes;
                    debug!(%addr, class = %class, "refreshed existing lease");
                    return Ok(addr);
                }
            }
        }

        // vacant, or left behind by a release still in progress
        match self.insert_new(engine, class, req, lifetimes, rng) {
            Ok(addr) => {
                index.insert(addr);
                Ok(addr)
            }
            Err(e) => {
                if let Entry::Occupied(stale) = index {
                    stale.remove();
                }
                Err(e)
            }
        }
    }

    fn insert_new<R: Rng>(
        &self,
        engine: &PolicyEngine,
        class: ClassId,
        req: &ClientRequest,
        lifetimes: Lifetimes,
        rng: &mut R,
    ) -> Result<Ipv6Addr, PolicyError> {
        let table = engine.table();
        let iface = table
            .interface_of(class)
            .ok_or(PolicyError::UnknownClass(class))?;
        engine.admit(class)?;

        let now = Instant::now();
        let lease = Lease {
            duid: req.duid.clone(),
            iface: iface.into(),
            class,
            lifetimes,
            first_leased: now,
            last_leased: now,
        };

        if let Some(hint) = req.address {
            if engine.class_for_address(iface, &hint) == Some(class) {
                if let Entry::Vacant(slot) = self.leases.entry(hint) {
                    slot.insert(lease);
                    info!(addr = %hint, class = %class, iface, "leased requested address");
                    return Ok(hint);
                }
            }
        }

        for attempt in 1..=MAX_DRAW_ATTEMPTS {
            let addr = match engine.allocate_address_with(class, rng) {
                Ok(addr) => addr,
                Err(e) => {
                    self.give_back(engine, class);
                    return Err(e);
                }
            };
            if let Entry::Vacant(slot) = self.leases.entry(addr) {
                slot.insert(lease);
                info!(%addr, class = %class, iface, attempt, "leased address");
                return Ok(addr);
            }
        }

        self.give_back(engine, class);
        warn!(class = %class, attempts = MAX_DRAW_ATTEMPTS, "no free address found");
        Err(PolicyError::AddressUnavailable {
            class,
            attempts: MAX_DRAW_ATTEMPTS,
        })
    }

    fn give_back(&self, engine: &PolicyEngine, class: ClassId) {
        match engine.release(class) {
            Ok(_) => {}
            // the class went away in a reload, nothing left to count against
            Err(e) => debug!(class = %class, %e, "release skipped"),
        }
    }

    /// Drop the index slot of a removed lease unless it was re-pointed.
    fn forget(&self, lease: &Lease, addr: &Ipv6Addr) {
        self.by_client
            .remove_if(&(lease.duid.clone(), lease.class), |_, held| held == addr);
    }

    pub fn release(&self, engine: &PolicyEngine, addr: &Ipv6Addr) -> Option<Lease> {
        let _shared = self.shared();
        let (_, lease) = self.leases.remove(addr)?;
        self.forget(&lease, addr);
        self.give_back(engine, lease.class);
        info!(%addr, duid = %lease.duid, class = %lease.class, "released lease");
        Some(lease)
    }

    /// Remove leases past their valid lifetime and release them from their
    /// classes. Returns the number evicted.
    pub fn evict_expired(&self, engine: &PolicyEngine) -> usize {
        let _shared = self.shared();
        let now = Instant::now();
        let expired: Vec<Ipv6Addr> = self
            .leases
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| *e.key())
            .collect();

        let mut evicted = 0;
        for addr in expired {
            // re-check under the shard lock, the lease may have been refreshed
            if let Some((_, lease)) = self.leases.remove_if(&addr, |_, l| l.is_expired(now)) {
                self.forget(&lease, &addr);
                self.give_back(engine, lease.class);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.leases.len(), "evicted expired leases");
        }
        evicted
    }

    /// Replace the engine's class table and count every lease against the
    /// class now owning its address. No lease is granted, released or
    /// evicted in between. Returns (kept, dropped).
    pub fn swap_table(&self, engine: &PolicyEngine, table: ClassTable) -> (usize, usize) {
        let _exclusive = self.table_gate.write().unwrap_or_else(PoisonError::into_inner);
        engine.reload(table);
        self.reattribute(engine)
    }

    /// Leases no class covers any more, or that do not fit a class's quota,
    /// are dropped.
    fn reattribute(&self, engine: &PolicyEngine) -> (usize, usize) {
        let mut dropped = Vec::new();
        for mut entry in self.leases.iter_mut() {
            let addr = *entry.key();
            let owner = engine
                .class_for_address(&entry.iface, &addr)
                .filter(|id| engine.admit(*id).is_ok());
            match owner {
                Some(id) => entry.class = id,
                None => dropped.push(addr),
            }
        }

        for addr in &dropped {
            if let Some((_, lease)) = self.leases.remove(addr) {
                info!(%addr, duid = %lease.duid, iface = %lease.iface, "dropped lease after reload");
            }
        }

        let held: Vec<_> = self
            .leases
            .iter()
            .map(|e| ((e.duid.clone(), e.class), *e.key()))
            .collect();
        self.by_client.clear();
        for (key, addr) in held {
            self.by_client.insert(key, addr);
        }

        let kept = self.leases.len();
        info!(kept, dropped = dropped.len(), "leases reattributed");
        (kept, dropped.len())
    }

    /// Spawn a cleanup thread that periodically evicts expired leases.
    pub fn spawn_cleanup_thread(
        self: &Arc<Self>,
        engine: Arc<PolicyEngine>,
        interval: Duration,
    ) -> std::thread::JoinHandle<()> {
        let db = Arc::clone(self);
        std::thread::Builder::new()
            .name("leasedb-cleanup".into())
            .spawn(move || loop {
                std::thread::sleep(interval);
                db.evict_expired(&engine);
            })
            .expect("failed to spawn leasedb cleanup thread")
    }
}
