//! Control-plane facade of the broker.
//!
//! [`Broker`] owns every store behind one lock and exposes the calls a
//! control plane makes: register operations, dispatch synchronous or
//! asynchronous calls to the fleet, and cancel them. Inbound peer traffic is
//! handled by the [`Dispatcher`] obtained from [`Broker::dispatcher`].
//!
//! The lock is never held across an `.await`; transport I/O always happens
//! after the state change it depends on has been committed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activity_store::ActivityStore;
use crate::admission::AdmissionPolicy;
use crate::config::{check_admission_policy, check_survey_threshold, BrokerConfig};
use crate::device_registry::DeviceRegistry;
use crate::dispatcher::Dispatcher;
use crate::envelope::{Command, Envelope, Mode};
use crate::error::{BrokerError, Phase};
use crate::function_registry::{ArgMask, FunctionRegistry, Handler};
use crate::hash::run_id_for;
use crate::metrics::BrokerMetrics;
use crate::port_pool::PortAllocator;
use crate::publish_queue::PublishQueue;
use crate::run_table::{Completion, RunPhase, RunTable};
use crate::survey::SurveyLease;
use crate::transport::{PublishChannel, Transport};
use crate::types::{RunId, Value};

/// The mutable tables shared by the control plane and the dispatcher.
#[derive(Debug)]
pub(crate) struct BrokerState {
    pub(crate) devices: DeviceRegistry,
    pub(crate) functions: FunctionRegistry,
    pub(crate) activities: ActivityStore,
    pub(crate) runs: RunTable,
    pub(crate) queue: PublishQueue,
    pub(crate) ports: PortAllocator,
    pub(crate) policy: AdmissionPolicy,
    pub(crate) survey_threshold: f64,
}

impl BrokerState {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            devices: DeviceRegistry::new(config.staleness_window),
            functions: FunctionRegistry::new(),
            activities: ActivityStore::new(),
            runs: RunTable::new(),
            queue: PublishQueue::new(),
            ports: PortAllocator::new(config.request_ports.clone(), config.survey_ports.clone()),
            policy: config.admission_policy,
            survey_threshold: config.survey_threshold,
        }
    }
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) state: Mutex<BrokerState>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub mode: Mode,
    pub phase: RunPhase,
    pub needed: u32,
    pub replied: u32,
    pub survey_port: Option<u16>,
    pub results: Vec<Value>,
}

/// Handle to a running broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker over `transport`. Fails if `config` does not validate.
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self, BrokerError> {
        config.validate()?;
        let inner = Arc::new(BrokerInner {
            state: Mutex::new(BrokerState::new(&config)),
            config,
            transport,
            metrics,
            shutdown: CancellationToken::new(),
        });
        inner.refresh_metrics();
        Ok(Self { inner })
    }

    /// Inbound side of the broker, to be driven by the transport.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.inner))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Start the periodic broadcast retry loop. It runs until [`shutdown`](Self::shutdown).
    pub fn spawn_publisher(&self) -> JoinHandle<()> {
        let broker = self.clone();
        let period = self.inner.config.publish_interval;
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        broker.publish_tick().await;
                    }
                }
            }
            debug!("publisher stopped");
        })
    }

    /// Stop background tasks. Live runs are left to their deadlines.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Register an operation peers may invoke by name.
    pub fn register_function(
        &self,
        name: &str,
        handler: Handler,
        mask: &str,
    ) -> Result<(), BrokerError> {
        let mask = ArgMask::parse(mask)?;
        self.inner.state.lock().functions.register(name, handler, mask)
    }

    /// Change the admission policy for subsequent readiness signals.
    ///
    /// Rejected with `InvalidConfig` under the same rules as
    /// [`BrokerConfig::validate`].
    pub fn set_admission_policy(&self, policy: AdmissionPolicy) -> Result<(), BrokerError> {
        check_admission_policy(policy)?;
        self.inner.state.lock().policy = policy;
        Ok(())
    }

    /// Change the survey threshold for subsequent survey responses.
    pub fn set_survey_threshold(&self, threshold: f64) -> Result<(), BrokerError> {
        check_survey_threshold(threshold)?;
        self.inner.state.lock().survey_threshold = threshold;
        Ok(())
    }

    /// Invoke `name` across the fleet and wait for admission and then for the
    /// result survey.
    ///
    /// On failure the residual run state is cancelled before the error is
    /// returned. Phase deadlines tear the run down on their own, so dropping
    /// the returned future leaks nothing.
    #[instrument(skip(self, args))]
    pub async fn remote_sync_exec(
        &self,
        name: &str,
        args: Vec<Value>,
        expr: &str,
    ) -> Result<Vec<Value>, BrokerError> {
        let (run_id, call) = call_for(Mode::Sync, name, args, expr)?;
        let dispatched = self.inner.create_run(&run_id, Mode::Sync, call)?;
        let generation = dispatched.generation;

        let outcome = match dispatched.admission {
            Some(admission) => self.inner.await_sync(&run_id, generation, admission).await,
            None => Err(BrokerError::Cancelled {
                run_id: run_id.clone(),
            }),
        };
        match outcome {
            Ok(results) => Ok(results),
            Err(error @ BrokerError::Cancelled { .. }) => Err(error),
            Err(error) => {
                warn!(run_id = %run_id, error = %error, "synchronous call failed");
                // Usually already torn down by its deadline. A newer call
                // with the same id may also have replaced this run.
                self.inner.cancel(&run_id, Some(generation)).await;
                Err(error)
            }
        }
    }

    /// Dispatch `name` to the fleet without waiting. Peers are admitted under
    /// the same policy as synchronous calls.
    #[instrument(skip(self, args))]
    pub async fn remote_async_exec(
        &self,
        name: &str,
        args: Vec<Value>,
        expr: &str,
    ) -> Result<RunId, BrokerError> {
        let (run_id, call) = call_for(Mode::Async, name, args, expr)?;
        self.inner.create_run(&run_id, Mode::Async, call)?;
        Ok(run_id)
    }

    /// Cancel the asynchronous call that `remote_async_exec(name, args, expr)`
    /// dispatched.
    pub async fn cancel_async_exec(
        &self,
        name: &str,
        args: Vec<Value>,
        expr: &str,
    ) -> Result<bool, BrokerError> {
        let (run_id, _) = call_for(Mode::Async, name, args, expr)?;
        Ok(self.cancel(&run_id).await)
    }

    /// Tear down a run and ask peers to abandon it.
    ///
    /// The kill broadcast is best-effort; peers already executing may still
    /// finish. Returns `false` if the run is unknown.
    pub async fn cancel(&self, run_id: &RunId) -> bool {
        self.inner.cancel(run_id, None).await
    }

    /// Send every queued broadcast once. Returns how many were sent.
    pub async fn publish_tick(&self) -> usize {
        let due = self.inner.state.lock().queue.tick();
        if !due.is_empty() {
            debug!(count = due.len(), "retransmitting broadcasts");
        }
        for envelope in &due {
            if let Err(error) = self
                .inner
                .transport
                .publish(PublishChannel::Devices, envelope)
                .await
            {
                warn!(error = %error, command = %envelope.cmd, "broadcast failed");
            }
        }
        self.inner.refresh_metrics();
        due.len()
    }

    pub fn run(&self, run_id: &RunId) -> Option<RunSnapshot> {
        let state = self.inner.state.lock();
        state.runs.get(run_id).map(|entry| RunSnapshot {
            run_id: entry.run_id().clone(),
            mode: entry.mode(),
            phase: entry.phase(),
            needed: entry.needed(),
            replied: entry.replied(),
            survey_port: entry.survey_port(),
            results: entry.results().to_vec(),
        })
    }

    pub fn active_devices(&self) -> usize {
        self.inner.state.lock().devices.active_count()
    }

    pub fn survey_ports_available(&self) -> usize {
        self.inner.state.lock().ports.survey.available()
    }

    pub fn request_ports_available(&self) -> usize {
        self.inner.state.lock().ports.request.available()
    }

    /// Remaining retry budget of each queued broadcast tagged `tag`.
    pub fn queued_retries(&self, tag: &RunId) -> Vec<u32> {
        self.inner.state.lock().queue.retries_for(tag)
    }
}

/// Build the call envelope of `name` and derive its run id.
fn call_for(
    mode: Mode,
    name: &str,
    args: Vec<Value>,
    expr: &str,
) -> Result<(RunId, Envelope), BrokerError> {
    let call = Envelope::call(mode, name, expr, args);
    let run_id = run_id_for(&call)?;
    let call = call.with_actid(run_id.to_string());
    Ok((run_id, call))
}

type AdmissionWaiter = oneshot::Receiver<Result<(), BrokerError>>;

/// A freshly created run.
struct Dispatched {
    generation: u64,
    /// Settles with the admission outcome; synchronous runs only.
    admission: Option<AdmissionWaiter>,
}

impl BrokerInner {
    /// Create the run for `call` and queue its dissemination.
    ///
    /// Synchronous runs lease their survey port here and arm the admission
    /// deadline; the returned receiver settles when admission does.
    fn create_run(
        self: &Arc<Self>,
        run_id: &RunId,
        mode: Mode,
        call: Envelope,
    ) -> Result<Dispatched, BrokerError> {
        let (dispatched, stale_port) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let lease = match mode {
                Mode::Sync => Some(SurveyLease::new(state.ports.survey.acquire()?)),
                Mode::Async => None,
            };
            let needed = u32::try_from(state.devices.active_count()).unwrap_or(u32::MAX);
            let (entry, replaced) = state.runs.create(run_id.clone(), mode, needed);
            entry.lease = lease;
            let generation = entry.generation();
            let admission = match mode {
                Mode::Sync => {
                    let deadline = CancellationToken::new();
                    let (completion, rx) = Completion::armed(deadline.clone());
                    entry.admission = completion;
                    self.arm_deadline(
                        run_id.clone(),
                        Phase::Admission,
                        deadline,
                        self.config.admission_timeout,
                    );
                    Some(rx)
                }
                Mode::Async => None,
            };
            entry.dispatched();

            let stale_port = replaced
                .and_then(|mut old| old.take_lease())
                .and_then(|lease| lease.release(&mut state.ports.survey));
            state.queue.remove(run_id);
            state
                .queue
                .enqueue(call, run_id.clone(), self.config.publish_retries);
            info!(run_id = %run_id, needed, mode = mode.wire(), "call dispatched");
            (
                Dispatched {
                    generation,
                    admission,
                },
                stale_port,
            )
        };
        if let Some(port) = stale_port {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move { transport.close_survey(port).await });
        }
        self.refresh_metrics();
        Ok(dispatched)
    }

    /// Wait for admission, then run the result survey.
    async fn await_sync(
        self: &Arc<Self>,
        run_id: &RunId,
        generation: u64,
        admission: AdmissionWaiter,
    ) -> Result<Vec<Value>, BrokerError> {
        settled(run_id, admission.await)?;
        let (port, survey) = self.begin_survey(run_id, generation)?;

        self.transport.bind_survey(port).await?;
        if !self.owns_survey(run_id, generation, port) {
            // Torn down while the channel was opening; its release could not
            // close a channel that did not exist yet.
            self.transport.close_survey(port).await;
            return settled(run_id, survey.await);
        }
        let report = Envelope::new(Command::ReportReq)
            .with_actname("EVENTLOOP")
            .with_actarg(run_id.to_string());
        self.transport.survey(port, &report).await?;
        debug!(run_id = %run_id, port, "survey started");

        settled(run_id, survey.await)
    }

    fn begin_survey(
        self: &Arc<Self>,
        run_id: &RunId,
        generation: u64,
    ) -> Result<(u16, oneshot::Receiver<Result<Vec<Value>, BrokerError>>), BrokerError> {
        let cancelled = || BrokerError::Cancelled {
            run_id: run_id.clone(),
        };
        let mut state = self.state.lock();
        let entry = state
            .runs
            .get_mut(run_id)
            .filter(|entry| entry.generation() == generation)
            .ok_or_else(cancelled)?;
        let port = entry.survey_port().ok_or_else(|| BrokerError::NotFound {
            what: format!("survey port of run {run_id}"),
        })?;

        let deadline = CancellationToken::new();
        let survey = entry
            .begin_survey(deadline.clone())
            .ok_or_else(cancelled)?;
        if let Some(lease) = entry.lease.as_mut() {
            lease.bound = true;
        }
        self.arm_deadline(
            run_id.clone(),
            Phase::Survey,
            deadline,
            self.config.survey_timeout,
        );
        Ok((port, survey))
    }

    /// Whether generation `generation` of `run_id` still holds `port`.
    fn owns_survey(&self, run_id: &RunId, generation: u64, port: u16) -> bool {
        self.state
            .lock()
            .runs
            .get(run_id)
            .filter(|entry| entry.generation() == generation)
            .is_some_and(|entry| entry.survey_port() == Some(port))
    }

    /// Spawn the deadline of one phase. Settling the phase cancels `token`,
    /// which disarms the deadline.
    fn arm_deadline(
        self: &Arc<Self>,
        run_id: RunId,
        phase: Phase,
        token: CancellationToken,
        after: Duration,
    ) {
        let inner: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.expire(&run_id, phase, &token).await;
                    }
                }
            }
        });
    }

    /// A phase deadline fired. An expired run is torn down here, so its
    /// resources come back even if nobody awaits the outcome anymore.
    async fn expire(&self, run_id: &RunId, phase: Phase, token: &CancellationToken) {
        let stale_ports = {
            let mut guard = self.state.lock();
            // Settled, or the run was replaced, after the timer fired.
            if token.is_cancelled() {
                return;
            }
            let state = &mut *guard;
            let (expired, lease) = match phase {
                Phase::Admission => (state.runs.expire_admission(run_id), None),
                Phase::Survey => match state
                    .runs
                    .get_mut(run_id)
                    .and_then(|entry| entry.expire_survey())
                {
                    Some(lease) => (true, lease),
                    None => (false, None),
                },
            };
            if !expired {
                return;
            }
            let mut ports: Vec<u16> = lease
                .and_then(|lease| lease.release(&mut state.ports.survey))
                .into_iter()
                .collect();
            ports.extend(self.teardown(state, run_id).flatten());
            ports
        };
        for port in stale_ports {
            self.transport.close_survey(port).await;
        }
        self.refresh_metrics();
    }

    /// Cancel `run_id`, or only its given generation if one is named.
    pub(crate) async fn cancel(&self, run_id: &RunId, generation: Option<u64>) -> bool {
        let stale_port = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let current = state.runs.get(run_id).map(|entry| entry.generation());
            if current.is_none() || generation.is_some_and(|g| current != Some(g)) {
                return false;
            }
            match self.teardown(state, run_id) {
                Some(port) => port,
                None => return false,
            }
        };
        if let Some(port) = stale_port {
            self.transport.close_survey(port).await;
        }
        self.refresh_metrics();
        true
    }

    /// Remove `run_id`, swap its queued call for a kill broadcast and give
    /// back its survey port.
    ///
    /// Returns `None` if the run is unknown, else the port whose survey
    /// channel must still be closed, if any.
    fn teardown(&self, state: &mut BrokerState, run_id: &RunId) -> Option<Option<u16>> {
        let mut entry = state.runs.remove(run_id)?;
        let dropped = state.queue.remove(run_id);
        let kill = Envelope::new(Command::RexecKill)
            .with_actname("ACTIVITY")
            .with_actarg(run_id.to_string());
        state
            .queue
            .enqueue(kill, run_id.clone(), self.config.publish_retries);
        info!(run_id = %run_id, dropped, "run torn down");
        Some(
            entry
                .take_lease()
                .and_then(|lease| lease.release(&mut state.ports.survey)),
        )
    }

    /// Mirror table sizes into the gauges. Takes the state lock.
    pub(crate) fn refresh_metrics(&self) {
        let state = self.state.lock();
        let m = &self.metrics;
        m.devices.set(state.devices.len() as i64);
        m.devices_active.set(state.devices.active_count() as i64);
        m.runs.set(state.runs.len() as i64);
        m.publish_queue.set(state.queue.len() as i64);
        m.request_ports_free.set(state.ports.request.available() as i64);
        m.survey_ports_free.set(state.ports.survey.available() as i64);
    }
}

/// Flatten a phase completion. A dropped sender means the run was removed.
fn settled<T>(
    run_id: &RunId,
    received: Result<Result<T, BrokerError>, oneshot::error::RecvError>,
) -> Result<T, BrokerError> {
    received.unwrap_or_else(|_| {
        Err(BrokerError::Cancelled {
            run_id: run_id.clone(),
        })
    })
}
