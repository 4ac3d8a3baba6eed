//! Picks the address class a client leases from.
//!
//! Only eligible classes with quota left are candidates. Classes that list
//! the client in their accept-only ranges win over the rest, and the
//! remaining tie is broken by a random draw weighted by `share`.

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::{
    addrclass::{AddressClass, ClassId},
    engine::ClientRequest,
    error::PolicyError,
};

pub struct ClassSelector<'a> {
    classes: &'a [Arc<AddressClass>],
}

impl<'a> ClassSelector<'a> {
    pub fn new(classes: &'a [Arc<AddressClass>]) -> Self {
        Self { classes }
    }

    /// Classes the client may use at all, in configuration order.
    pub fn eligible(&self, req: &ClientRequest) -> Vec<&'a Arc<AddressClass>> {
        self.classes
            .iter()
            .filter(|c| c.is_eligible(&req.duid, req.address.as_ref(), req.message.as_ref()))
            .collect()
    }

    pub fn select<R: Rng>(
        &self,
        req: &ClientRequest,
        rng: &mut R,
    ) -> Result<ClassId, PolicyError> {
        let eligible = self.eligible(req);
        if eligible.is_empty() {
            debug!(duid = %req.duid, "no eligible class");
            return Err(PolicyError::NoEligibleClass);
        }

        let open: Vec<_> = eligible.into_iter().filter(|c| c.has_capacity()).collect();
        if open.is_empty() {
            debug!(duid = %req.duid, "every eligible class is full");
            return Err(PolicyError::PoolExhausted);
        }

        let preferred: Vec<_> = open
            .iter()
            .copied()
            .filter(|c| c.is_preferred(&req.duid, req.address.as_ref()))
            .collect();
        let candidates = if preferred.is_empty() { open } else { preferred };

        let chosen = weighted_pick(&candidates, rng);
        debug!(
            duid = %req.duid,
            class = %chosen.id(),
            candidates = candidates.len(),
            share = chosen.share(),
            "selected class"
        );
        Ok(chosen.id())
    }
}

/// Pick one class with probability proportional to its share. When every
/// share is zero the pick is uniform.
fn weighted_pick<'a, R: Rng>(
    candidates: &[&'a Arc<AddressClass>],
    rng: &mut R,
) -> &'a Arc<AddressClass> {
    let total: u64 = candidates.iter().map(|c| u64::from(c.share())).sum();
    if total == 0 {
        return candidates[rng.random_range(0..candidates.len())];
    }

    let mut ticket = rng.random_range(0..total);
    for class in candidates.iter().copied() {
        let share = u64::from(class.share());
        if ticket < share {
            return class;
        }
        ticket -= share;
    }
    // ticket < total guarantees a hit above
    candidates[candidates.len() - 1]
}
