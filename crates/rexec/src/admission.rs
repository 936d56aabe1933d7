//! Admission policy and resolution condition of the admission phase.
//!
//! Two separate tests are evaluated after every readiness signal:
//!
//! - [`AdmissionPolicy::should_execute`] decides whether the peer that just
//!   replied is told to start or to stand down.
//! - [`AdmissionPolicy::should_resolve`] decides whether enough peers have
//!   been admitted for the caller's pending completion to resolve.
//!
//! A peer is started iff the run had not reached its resolution quorum before
//! that peer replied. With `Majority(0.5)` and `needed = 4` the decisions are
//! start, start, start, stand-down: the third peer sees `2/4 == 0.5` admitted
//! before it, which does not exceed the threshold, so it is started and its own
//! signal is the one that resolves the call (`3/4 > 0.5`).

use serde::{Deserialize, Serialize};

/// Per-peer outcome of a readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Start,
    StandDown,
}

/// Policy gating which replying peers execute a dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AdmissionPolicy {
    /// Admit peers until more than the given fraction of `needed` has replied.
    /// A threshold of `1.0` or more admits every respondent.
    Majority(f64),
    /// Admit only the first respondent.
    First,
}

impl AdmissionPolicy {
    /// Decide for the peer whose signal brought the count to `replied`.
    pub fn should_execute(&self, replied: u32, needed: u32) -> Decision {
        let admitted = match *self {
            AdmissionPolicy::Majority(p) if p >= 1.0 => true,
            AdmissionPolicy::Majority(_) => !self.should_resolve(replied.saturating_sub(1), needed),
            AdmissionPolicy::First => replied == 1,
        };
        if admitted {
            Decision::Start
        } else {
            Decision::StandDown
        }
    }

    /// Whether `replied` admissions out of `needed` satisfy the call.
    pub fn should_resolve(&self, replied: u32, needed: u32) -> bool {
        match *self {
            AdmissionPolicy::Majority(p) if p >= 1.0 => replied >= needed,
            AdmissionPolicy::Majority(p) => fraction(replied, needed) > p,
            AdmissionPolicy::First => replied == 1,
        }
    }
}

pub(crate) fn fraction(count: u32, needed: u32) -> f64 {
    f64::from(count) / f64::from(needed.max(1))
}
