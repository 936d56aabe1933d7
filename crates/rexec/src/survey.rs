//! Survey aggregator: the result-collection round of a synchronous run.
//!
//! A survey starts once admission resolves. Results pushed by peers are
//! appended in arrival order; the survey resolves with everything collected
//! so far as soon as `len(results) / needed` exceeds the survey threshold.
//! The run's survey port is given back whenever the run leaves `Surveying`.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::admission::fraction;
use crate::error::{BrokerError, Phase};
use crate::port_pool::PortPool;
use crate::run_table::{Completion, RunEntry, RunPhase};
use crate::types::Value;

/// A survey port owned by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurveyLease {
    pub port: u16,
    /// A survey channel was (or is being) opened on `port` and must be closed
    /// on release.
    pub bound: bool,
}

impl SurveyLease {
    pub fn new(port: u16) -> Self {
        Self { port, bound: false }
    }

    /// Return the port to `pool`. Yields the port whose channel must still be
    /// closed, if one was opened.
    pub(crate) fn release(self, pool: &mut PortPool) -> Option<u16> {
        pool.release(self.port);
        self.bound.then_some(self.port)
    }
}

/// Result of feeding one response into a survey.
#[derive(Debug, Clone, PartialEq)]
pub enum SurveyProgress {
    /// The run is not surveying, or already collected its quorum.
    Ignored,
    /// Appended; quorum not yet reached.
    Collecting { collected: usize },
    /// This response completed the survey. The survey port, if still held,
    /// is handed back to the caller for release.
    Resolved { lease: Option<SurveyLease> },
}

impl RunEntry {
    /// Enter `Surveying` with a waiter on the survey completion.
    ///
    /// Only valid right after admission resolved.
    pub(crate) fn begin_survey(
        &mut self,
        deadline: CancellationToken,
    ) -> Option<oneshot::Receiver<Result<Vec<Value>, BrokerError>>> {
        if self.phase != RunPhase::Resolved || self.collected {
            return None;
        }
        let (completion, rx) = Completion::armed(deadline);
        self.survey = completion;
        self.phase = RunPhase::Surveying;
        Some(rx)
    }

    /// Append a peer's result and resolve once the survey quorum is exceeded.
    pub(crate) fn collect(&mut self, value: Value, threshold: f64) -> SurveyProgress {
        if self.phase != RunPhase::Surveying || self.collected {
            return SurveyProgress::Ignored;
        }
        self.results.push(value);
        if fraction(self.results.len() as u32, self.needed()) > threshold {
            self.collected = true;
            self.phase = RunPhase::Resolved;
            self.survey.settle(Ok(self.results.clone()));
            tracing::info!(
                run_id = %self.run_id(),
                collected = self.results.len(),
                needed = self.needed(),
                "survey quorum reached"
            );
            return SurveyProgress::Resolved {
                lease: self.lease.take(),
            };
        }
        SurveyProgress::Collecting {
            collected: self.results.len(),
        }
    }

    /// Survey deadline elapsed: reject with no results.
    ///
    /// Returns the lease to release if this call ended the survey.
    pub(crate) fn expire_survey(&mut self) -> Option<Option<SurveyLease>> {
        if self.phase != RunPhase::Surveying {
            return None;
        }
        self.phase = RunPhase::SurveyTimeout;
        tracing::warn!(
            run_id = %self.run_id(),
            collected = self.results.len(),
            needed = self.needed(),
            "survey deadline elapsed"
        );
        self.survey.settle(Err(BrokerError::Timeout {
            run_id: self.run_id().clone(),
            phase: Phase::Survey,
        }));
        Some(self.lease.take())
    }

    /// Give up ownership of the survey port. Yields it at most once.
    pub(crate) fn take_lease(&mut self) -> Option<SurveyLease> {
        self.lease.take()
    }
}
