//! Run coordinator: per-call admission bookkeeping and completion.
//!
//! ```text
//! Created -> AwaitingAdmission -> Surveying -> Resolved
//!                 |                   \-> SurveyTimeout
//!                 |-> AdmissionTimeout
//!                 \-> Cancelled (from any state, by removal)
//! ```
//!
//! Asynchronous runs have no survey phase and move straight to `Resolved`
//! once their resolution condition holds.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionPolicy, Decision};
use crate::envelope::Mode;
use crate::error::{BrokerError, Phase};
use crate::publish_queue::PublishQueue;
use crate::survey::SurveyLease;
use crate::types::{RunId, Value};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Created,
    AwaitingAdmission,
    Surveying,
    Resolved,
    AdmissionTimeout,
    SurveyTimeout,
    Cancelled,
}

/// Single-writer completion of one phase.
///
/// Whichever of quorum, deadline or cancellation settles it first wins;
/// later attempts are no-ops. Settling also disarms the phase deadline.
#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<oneshot::Sender<Result<T, BrokerError>>>,
    deadline: Option<CancellationToken>,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self {
            tx: None,
            deadline: None,
        }
    }
}

impl<T> Completion<T> {
    /// Arm a completion whose waiter holds the returned receiver.
    pub fn armed(deadline: CancellationToken) -> (Self, oneshot::Receiver<Result<T, BrokerError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Some(tx),
                deadline: Some(deadline),
            },
            rx,
        )
    }

    pub fn is_pending(&self) -> bool {
        self.tx.is_some()
    }

    /// Settle with `result`. Returns `false` if already settled.
    pub fn settle(&mut self, result: Result<T, BrokerError>) -> bool {
        if let Some(deadline) = self.deadline.take() {
            deadline.cancel();
        }
        match self.tx.take() {
            Some(tx) => {
                // The waiter may have gone away; nothing left to notify then.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// State of one dispatched call.
#[derive(Debug)]
pub struct RunEntry {
    run_id: RunId,
    /// Distinguishes this run from earlier runs stored under the same id.
    generation: u64,
    mode: Mode,
    needed: u32,
    replied: u32,
    pub(crate) phase: RunPhase,
    pub(crate) admission: Completion<()>,
    pub(crate) survey: Completion<Vec<Value>>,
    pub(crate) lease: Option<SurveyLease>,
    pub(crate) results: Vec<Value>,
    pub(crate) collected: bool,
}

impl RunEntry {
    fn new(run_id: RunId, generation: u64, mode: Mode, needed: u32) -> Self {
        Self {
            run_id,
            generation,
            mode,
            needed,
            replied: 0,
            phase: RunPhase::Created,
            admission: Completion::default(),
            survey: Completion::default(),
            lease: None,
            results: Vec::new(),
            collected: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Peers expected to participate, fixed at creation.
    pub fn needed(&self) -> u32 {
        self.needed
    }

    pub fn replied(&self) -> u32 {
        self.replied
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Survey port currently owned by this run.
    pub fn survey_port(&self) -> Option<u16> {
        self.lease.map(|l| l.port)
    }

    pub fn results(&self) -> &[Value] {
        &self.results
    }

    /// Mark the call as broadcast to the fleet.
    pub fn dispatched(&mut self) {
        if self.phase == RunPhase::Created {
            self.phase = RunPhase::AwaitingAdmission;
        }
    }

    /// Settle every pending completion with `Cancelled`.
    pub(crate) fn abort(&mut self) {
        self.phase = RunPhase::Cancelled;
        self.admission.settle(Err(BrokerError::Cancelled {
            run_id: self.run_id.clone(),
        }));
        self.survey.settle(Err(BrokerError::Cancelled {
            run_id: self.run_id.clone(),
        }));
    }
}

/// Outcome of one readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub decision: Decision,
    /// This signal satisfied the resolution condition of the run.
    pub resolved: bool,
    /// Survey port the admitted peer reports to, for synchronous runs.
    pub survey_port: Option<u16>,
}

/// Table of live runs.
#[derive(Debug, Default)]
pub struct RunTable {
    runs: HashMap<RunId, RunEntry>,
    next_generation: u64,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the run `run_id` expecting `needed` peers, clamped to at least one.
    ///
    /// A run already stored under the same id is cancelled and handed back so
    /// the caller can release the resources it still owns.
    pub fn create(
        &mut self,
        run_id: RunId,
        mode: Mode,
        needed: u32,
    ) -> (&mut RunEntry, Option<RunEntry>) {
        let mut replaced = self.runs.remove(&run_id);
        if let Some(old) = replaced.as_mut() {
            old.abort();
        }
        tracing::debug!(run_id = %run_id, needed, replaced = replaced.is_some(), "run created");
        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = self
            .runs
            .entry(run_id.clone())
            .or_insert_with(|| RunEntry::new(run_id, generation, mode, needed.max(1)));
        (entry, replaced)
    }

    /// Count a readiness signal for `run_id` and decide for the replying peer.
    ///
    /// Once every expected peer has replied, queued retransmissions of the
    /// call are removed. Returns `None` for unknown runs.
    pub fn admit(
        &mut self,
        run_id: &RunId,
        policy: AdmissionPolicy,
        queue: &mut PublishQueue,
    ) -> Option<Admission> {
        let entry = self.runs.get_mut(run_id)?;
        entry.replied += 1;
        if entry.replied >= entry.needed {
            queue.remove(run_id);
        }

        let decision = policy.should_execute(entry.replied, entry.needed);
        let mut resolved = false;
        if entry.phase == RunPhase::AwaitingAdmission
            && policy.should_resolve(entry.replied, entry.needed)
        {
            entry.phase = RunPhase::Resolved;
            entry.admission.settle(Ok(()));
            resolved = true;
            tracing::info!(
                run_id = %run_id,
                replied = entry.replied,
                needed = entry.needed,
                "admission quorum reached"
            );
        }

        Some(Admission {
            decision,
            resolved,
            survey_port: entry.survey_port(),
        })
    }

    /// Admission deadline elapsed. Returns `true` if this rejected the waiter.
    pub fn expire_admission(&mut self, run_id: &RunId) -> bool {
        let Some(entry) = self.runs.get_mut(run_id) else {
            return false;
        };
        if entry.phase != RunPhase::AwaitingAdmission {
            return false;
        }
        entry.phase = RunPhase::AdmissionTimeout;
        tracing::warn!(
            run_id = %run_id,
            replied = entry.replied,
            needed = entry.needed,
            "admission deadline elapsed"
        );
        entry.admission.settle(Err(BrokerError::Timeout {
            run_id: run_id.clone(),
            phase: Phase::Admission,
        }))
    }

    pub fn get(&self, run_id: &RunId) -> Option<&RunEntry> {
        self.runs.get(run_id)
    }

    pub fn get_mut(&mut self, run_id: &RunId) -> Option<&mut RunEntry> {
        self.runs.get_mut(run_id)
    }

    /// Remove a run, settling its pending completions with `Cancelled`.
    pub fn remove(&mut self, run_id: &RunId) -> Option<RunEntry> {
        let mut entry = self.runs.remove(run_id)?;
        entry.abort();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Command, Envelope};

    fn run(id: &str) -> RunId {
        RunId::new(id)
    }

    fn awaiting(
        table: &mut RunTable,
        id: &str,
        needed: u32,
    ) -> oneshot::Receiver<Result<(), BrokerError>> {
        let (entry, _) = table.create(run(id), Mode::Sync, needed);
        let (completion, rx) = Completion::armed(CancellationToken::new());
        entry.admission = completion;
        entry.dispatched();
        rx
    }

    #[test]
    fn majority_half_of_four_resolves_on_third() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        let mut rx = awaiting(&mut table, "r", 4);
        let policy = AdmissionPolicy::Majority(0.5);

        let outcomes: Vec<Admission> = (0..4)
            .map(|_| table.admit(&run("r"), policy, &mut queue).unwrap())
            .collect();
        let decisions: Vec<Decision> = outcomes.iter().map(|a| a.decision).collect();
        assert_eq!(
            decisions,
            vec![
                Decision::Start,
                Decision::Start,
                Decision::Start,
                Decision::StandDown
            ]
        );
        let resolved: Vec<bool> = outcomes.iter().map(|a| a.resolved).collect();
        assert_eq!(resolved, vec![false, false, true, false]);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert_eq!(table.get(&run("r")).unwrap().phase(), RunPhase::Resolved);
    }

    #[test]
    fn first_policy_resolves_on_first_signal() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        let mut rx = awaiting(&mut table, "r", 3);

        let first = table.admit(&run("r"), AdmissionPolicy::First, &mut queue).unwrap();
        assert_eq!(first.decision, Decision::Start);
        assert!(first.resolved);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));

        for _ in 0..3 {
            let later = table.admit(&run("r"), AdmissionPolicy::First, &mut queue).unwrap();
            assert_eq!(later.decision, Decision::StandDown);
            assert!(!later.resolved);
        }
    }

    #[test]
    fn needed_is_fixed_and_replied_monotonic() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        table.create(run("r"), Mode::Async, 3).0.dispatched();

        let mut last = 0;
        for _ in 0..6 {
            table.admit(&run("r"), AdmissionPolicy::Majority(0.5), &mut queue);
            let entry = table.get(&run("r")).unwrap();
            assert_eq!(entry.needed(), 3);
            assert!(entry.replied() > last);
            last = entry.replied();
        }
    }

    #[test]
    fn needed_is_never_zero() {
        let mut table = RunTable::new();
        table.create(run("r"), Mode::Async, 0);
        assert_eq!(table.get(&run("r")).unwrap().needed(), 1);
    }

    #[test]
    fn full_reply_stops_retransmission() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        let call = Envelope::new(Command::RexecCall(Mode::Async));
        queue.enqueue(call.clone(), run("r"), 5);
        queue.enqueue(call, run("other"), 5);
        table.create(run("r"), Mode::Async, 2);

        table.admit(&run("r"), AdmissionPolicy::First, &mut queue);
        assert_eq!(queue.len(), 2);
        table.admit(&run("r"), AdmissionPolicy::First, &mut queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.retries_for(&run("other")), vec![5]);
    }

    #[test]
    fn unknown_run_is_not_admitted() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        assert!(table
            .admit(&run("missing"), AdmissionPolicy::First, &mut queue)
            .is_none());
    }

    #[test]
    fn expiry_and_resolution_are_exclusive() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        let mut rx = awaiting(&mut table, "r", 1);

        assert!(table.expire_admission(&run("r")));
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(BrokerError::Timeout { phase: Phase::Admission, .. }))
        ));

        let late = table.admit(&run("r"), AdmissionPolicy::First, &mut queue).unwrap();
        assert!(!late.resolved);
        assert_eq!(table.get(&run("r")).unwrap().phase(), RunPhase::AdmissionTimeout);
    }

    #[test]
    fn resolution_disarms_deadline() {
        let mut table = RunTable::new();
        let mut queue = PublishQueue::new();
        let deadline = CancellationToken::new();
        let (completion, _rx) = Completion::<()>::armed(deadline.clone());
        let (entry, _) = table.create(run("r"), Mode::Sync, 1);
        entry.admission = completion;
        entry.dispatched();

        table.admit(&run("r"), AdmissionPolicy::First, &mut queue);
        assert!(deadline.is_cancelled());
        assert!(!table.expire_admission(&run("r")));
    }

    #[test]
    fn recreating_a_run_cancels_the_old_one() {
        let mut table = RunTable::new();
        let mut rx = awaiting(&mut table, "r", 2);
        let (entry, replaced) = table.create(run("r"), Mode::Sync, 5);
        assert_eq!(entry.needed(), 5);
        assert_eq!(entry.replied(), 0);
        let new_generation = entry.generation();
        let replaced = replaced.unwrap();
        assert_eq!(replaced.phase(), RunPhase::Cancelled);
        assert_ne!(replaced.generation(), new_generation);
        assert!(matches!(rx.try_recv(), Ok(Err(BrokerError::Cancelled { .. }))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_cancels_waiter() {
        let mut table = RunTable::new();
        let mut rx = awaiting(&mut table, "r", 2);
        let entry = table.remove(&run("r")).unwrap();
        assert_eq!(entry.phase(), RunPhase::Cancelled);
        assert!(matches!(rx.try_recv(), Ok(Err(BrokerError::Cancelled { .. }))));
        assert!(table.is_empty());
    }
}
