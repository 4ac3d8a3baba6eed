//! Lease lifetime bounds and their negotiation.
//!
//! Every address class carries four configured ranges (T1, T2, preferred and
//! valid lifetime). A client's requested values are clamped into those ranges
//! field by field, and the resulting tuple is then checked against the
//! ordering rules a renewable lease must obey.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::PolicyError;

/// DHCPv6 "infinity" lifetime (RFC 8415 section 7.7).
pub const INFINITY: u32 = u32::MAX;

/// Closed range `[begin, end]` in seconds. `end` may be [`INFINITY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub begin: u32,
    pub end: u32,
}

impl Bounds {
    pub const UNBOUNDED: Bounds = Bounds {
        begin: 0,
        end: INFINITY,
    };

    pub const fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    /// Fixed value, `[secs, secs]`.
    pub const fn exactly(secs: u32) -> Self {
        Self {
            begin: secs,
            end: secs,
        }
    }

    pub fn clamp(&self, requested: u32) -> u32 {
        if requested < self.begin {
            return self.begin;
        }
        if requested > self.end {
            return self.end;
        }
        requested
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == INFINITY
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, infinity]", self.begin)
        } else {
            write!(f, "[{}, {}]", self.begin, self.end)
        }
    }
}

/// The four lease timers, either as requested by a client or as negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Lifetimes {
    pub t1: u32,
    pub t2: u32,
    pub preferred: u32,
    pub valid: u32,
}

impl Lifetimes {
    pub const fn new(t1: u32, t2: u32, preferred: u32, valid: u32) -> Self {
        Self {
            t1,
            t2,
            preferred,
            valid,
        }
    }

    /// Check the ordering a usable lease needs: renew before rebind, stop
    /// preferring before expiry, and renew before expiry.
    pub fn check_order(&self) -> Result<(), &'static str> {
        if self.t1 > self.t2 {
            return Err("T1 <= T2");
        }
        if self.preferred > self.valid {
            return Err("preferred <= valid");
        }
        if self.t1 > self.valid {
            return Err("T1 <= valid");
        }
        Ok(())
    }
}

impl fmt::Display for Lifetimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(t1={}, t2={}, preferred={}, valid={})",
            self.t1, self.t2, self.preferred, self.valid
        )
    }
}

/// Configured lifetime ranges of one address class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LifetimeContract {
    pub t1: Bounds,
    pub t2: Bounds,
    pub preferred: Bounds,
    pub valid: Bounds,
}

impl LifetimeContract {
    /// Clamp each requested field into its own bounds. The result is not
    /// checked for ordering, see [`LifetimeContract::negotiate`].
    pub fn clamp(&self, requested: &Lifetimes) -> Lifetimes {
        Lifetimes {
            t1: self.t1.clamp(requested.t1),
            t2: self.t2.clamp(requested.t2),
            preferred: self.preferred.clamp(requested.preferred),
            valid: self.valid.clamp(requested.valid),
        }
    }

    /// Clamp a client's request and verify the outcome is a usable lease.
    ///
    /// Fails with [`PolicyError::InvalidLeaseParameters`] instead of
    /// adjusting the tuple any further.
    pub fn negotiate(&self, requested: &Lifetimes) -> Result<Lifetimes, PolicyError> {
        let negotiated = self.clamp(requested);

        for (name, bounds, asked, got) in [
            ("t1", self.t1, requested.t1, negotiated.t1),
            ("t2", self.t2, requested.t2, negotiated.t2),
            ("preferred", self.preferred, requested.preferred, negotiated.preferred),
            ("valid", self.valid, requested.valid, negotiated.valid),
        ] {
            if asked != got {
                debug!(field = name, %bounds, requested = asked, negotiated = got, "clamped");
            }
        }

        negotiated
            .check_order()
            .map(|_| negotiated)
            .map_err(|reason| PolicyError::InvalidLeaseParameters { negotiated, reason })
    }

    /// Reject self-contradictory ranges before any client is served.
    ///
    /// Each range must be non-empty and T1's upper bound may not exceed
    /// T2's. The ordering rules are then replayed with the lower endpoints as
    /// a request, and again with the upper endpoints where both compared
    /// sides are finite.
    pub fn validate(&self) -> Result<(), String> {
        for (name, bounds) in [
            ("T1", self.t1),
            ("T2", self.t2),
            ("preferred", self.preferred),
            ("valid", self.valid),
        ] {
            if bounds.begin > bounds.end {
                return Err(format!("{name} range {bounds} is inverted"));
            }
        }

        if self.t1.end > self.t2.end {
            return Err(format!(
                "T1 range {} reaches past T2 range {}",
                self.t1, self.t2
            ));
        }

        let lower = Lifetimes::new(
            self.t1.begin,
            self.t2.begin,
            self.preferred.begin,
            self.valid.begin,
        );
        lower
            .check_order()
            .map_err(|rule| format!("lower bounds {lower} violate {rule}"))?;

        let upper = [
            (self.t1, self.t2, "T1 <= T2"),
            (self.preferred, self.valid, "preferred <= valid"),
            (self.t1, self.valid, "T1 <= valid"),
        ];
        for (left, right, rule) in upper {
            if !left.is_unbounded() && !right.is_unbounded() && left.end > right.end {
                return Err(format!("upper bounds {left} and {right} violate {rule}"));
            }
        }

        Ok(())
    }
}
