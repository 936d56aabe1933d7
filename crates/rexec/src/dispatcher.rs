//! Inbound protocol handling.
//!
//! The transport decodes nothing itself: it hands raw frames to
//! [`Dispatcher::handle_frame`] tagged with the channel they arrived on and
//! sends back the encoded reply, if any, on request/reply channels.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::activity_store::ActivityState;
use crate::admission::Decision;
use crate::broker::BrokerInner;
use crate::envelope::{Command, Envelope, IdAssignment, Mode, NakReason};
use crate::error::BrokerError;
use crate::survey::SurveyProgress;
use crate::types::{ActivityId, DeviceId, RunId, Value};

/// Channel an inbound frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundChannel {
    /// The fixed registration channel.
    Admin,
    /// A peer's private request/reply channel.
    Request,
    /// Responses on a run's survey channel.
    Survey,
}

/// Routes inbound envelopes to the broker's stores.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<BrokerInner>,
}

impl Dispatcher {
    pub(crate) fn new(inner: Arc<BrokerInner>) -> Self {
        Self { inner }
    }

    /// Decode `frame`, handle it, and encode the reply for request/reply
    /// channels. Survey responses produce no reply.
    pub async fn handle_frame(
        &self,
        channel: InboundChannel,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, BrokerError> {
        let envelope = Envelope::decode(frame)?;
        let reply = match channel {
            InboundChannel::Admin => Some(self.handle_admin(&envelope).await?),
            InboundChannel::Request => Some(self.handle_request(&envelope).await?),
            InboundChannel::Survey => {
                self.handle_survey_response(&envelope).await;
                None
            }
        };
        reply.map(|envelope| envelope.encode()).transpose()
    }

    /// Handle a message on the admin channel. Only registration is accepted.
    pub async fn handle_admin(&self, envelope: &Envelope) -> Result<Envelope, BrokerError> {
        match envelope.command() {
            Ok(Command::Register) => self.register(envelope).await,
            Ok(_) => {
                warn!(cmd = %envelope.cmd, opt = %envelope.opt, "unexpected admin command");
                Err(BrokerError::UnknownCommand {
                    cmd: envelope.cmd.clone(),
                    opt: envelope.opt.clone(),
                })
            }
            Err(error) => {
                warn!(error = %error, "unknown admin command");
                Err(error)
            }
        }
    }

    /// `REGISTER/DEVICE`: `actname` carries the app name, `actid` the claimed
    /// device id. The reply keeps the request's fields and puts the assigned
    /// port and final device id in `args`.
    async fn register(&self, envelope: &Envelope) -> Result<Envelope, BrokerError> {
        let port = self.inner.state.lock().ports.request.acquire()?;
        if let Err(error) = self.inner.transport.bind_request(port).await {
            warn!(port, error = %error, "failed to open request channel");
            self.inner.state.lock().ports.request.release(port);
            return Err(error);
        }

        let registration = self
            .inner
            .state
            .lock()
            .devices
            .register(&envelope.actname, &envelope.actid, port);
        self.inner.refresh_metrics();

        let (cmd, opt) = Command::RegisterAck(registration.assignment).wire();
        let mut reply = envelope.clone();
        reply.cmd = cmd.to_string();
        reply.opt = opt.to_string();
        reply.args = vec![
            Value::from(port),
            Value::from(registration.device_id.to_string()),
        ];
        if registration.assignment == IdAssignment::Alternate {
            debug!(claimed = %envelope.actid, assigned = %registration.device_id, "device id collided");
        }
        Ok(reply)
    }

    /// Handle a message on a peer's request channel.
    pub async fn handle_request(&self, envelope: &Envelope) -> Result<Envelope, BrokerError> {
        let command = envelope.command().inspect_err(|error| {
            warn!(error = %error, "unknown request command");
        })?;
        match command {
            Command::Rexec(mode) => Ok(self.invoke(envelope, mode)),
            Command::ResultGet => Ok(self.poll_result(envelope)),
            Command::RexecReady(mode) => Ok(self.ready(envelope, mode)),
            Command::Ping => {
                self.inner
                    .state
                    .lock()
                    .devices
                    .heartbeat(&DeviceId::new(envelope.actid.clone()));
                self.inner.refresh_metrics();
                let mut pong = envelope.clone();
                let (cmd, _) = Command::Pong.wire();
                pong.cmd = cmd.to_string();
                Ok(pong)
            }
            other => {
                warn!(command = %other, "command not accepted on request channel");
                Err(BrokerError::UnknownCommand {
                    cmd: envelope.cmd.clone(),
                    opt: envelope.opt.clone(),
                })
            }
        }
    }

    /// `REXEC`: a peer invokes an operation registered on the broker.
    ///
    /// The acknowledgement is returned before the handler has run; its
    /// result is stored under the request's `actid` for later polling.
    fn invoke(&self, envelope: &Envelope, mode: Mode) -> Envelope {
        let entry = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.functions.resolve(&envelope.actname).cloned() else {
                debug!(function = %envelope.actname, "invocation of unknown function");
                return nak(envelope, mode, NakReason::NotFound);
            };
            if mode == Mode::Sync && !entry.mask.check_args(&envelope.args) {
                debug!(function = %envelope.actname, mask = %entry.mask, "illegal arguments");
                return nak(envelope, mode, NakReason::IllegalParams);
            }
            state
                .activities
                .mark_pending(ActivityId::new(envelope.actid.clone()));
            entry
        };

        let inner = Arc::clone(&self.inner);
        let activity = ActivityId::new(envelope.actid.clone());
        let args = envelope.args.clone();
        tokio::spawn(async move {
            let handler = Arc::clone(&entry.handler);
            let outcome = tokio::spawn(async move { handler(args.as_slice()) }).await;
            let mut state = inner.state.lock();
            match outcome {
                Ok(value) => {
                    debug!(function = %entry.name, activity = %activity, "activity complete");
                    state.activities.complete(activity, value);
                }
                Err(error) => {
                    warn!(function = %entry.name, activity = %activity, error = %error, "activity failed");
                    state.activities.fail(activity, error.to_string());
                }
            }
        });

        envelope.reply(Command::RexecAck(mode), "ACTIVITY")
    }

    /// `REXEC-RES/GET`: report the stored outcome of activity `actid`.
    fn poll_result(&self, envelope: &Envelope) -> Envelope {
        let state = self.inner.state.lock();
        let put = Envelope::new(Command::ResultPut)
            .with_actname("ACTIVITY")
            .with_actid(envelope.actid.clone());
        match state.activities.poll(&ActivityId::new(envelope.actid.clone())) {
            None => put.with_actarg("NOT-FOUND"),
            Some(ActivityState::Pending) => put.with_actarg("PENDING"),
            Some(ActivityState::Done(value)) => {
                put.with_actarg("RESULTS").with_args(vec![value.clone()])
            }
            Some(ActivityState::Failed(reason)) => put
                .with_actarg("FAILED")
                .with_args(vec![Value::from(reason.as_str())]),
        }
    }

    /// `REXEC-RDY`: a peer is ready to run the call whose run id is in
    /// `actarg`. Unknown runs are told to stand down.
    fn ready(&self, envelope: &Envelope, mode: Mode) -> Envelope {
        let run_id = RunId::new(envelope.actarg.clone());
        let admission = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.runs.admit(&run_id, state.policy, &mut state.queue)
        };
        self.inner.refresh_metrics();

        let Some(admission) = admission else {
            debug!(run_id = %run_id, "readiness for unknown run");
            return envelope.reply(Command::RexecQuit(mode), "EVENTLOOP");
        };
        match admission.decision {
            Decision::Start => {
                let start = envelope.reply(Command::RexecStart(mode), "EVENTLOOP");
                match (mode, admission.survey_port) {
                    (Mode::Sync, Some(port)) => start.with_args(vec![Value::from(port)]),
                    _ => start,
                }
            }
            Decision::StandDown => envelope.reply(Command::RexecQuit(mode), "EVENTLOOP"),
        }
    }

    /// A response on a survey channel: `actarg` names the run, `args[0]`
    /// carries the peer's result. Responses without a value are ignored.
    pub async fn handle_survey_response(&self, envelope: &Envelope) {
        let Some(value) = envelope.args.first().cloned() else {
            debug!(actarg = %envelope.actarg, "survey response without a value");
            return;
        };
        let run_id = RunId::new(envelope.actarg.clone());
        let stale_port = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let threshold = state.survey_threshold;
            let Some(entry) = state.runs.get_mut(&run_id) else {
                debug!(run_id = %run_id, "survey response for unknown run");
                return;
            };
            match entry.collect(value, threshold) {
                SurveyProgress::Resolved { lease } => {
                    lease.and_then(|lease| lease.release(&mut state.ports.survey))
                }
                SurveyProgress::Collecting { .. } | SurveyProgress::Ignored => None,
            }
        };
        if let Some(port) = stale_port {
            self.inner.transport.close_survey(port).await;
        }
        self.inner.refresh_metrics();
    }
}

fn nak(envelope: &Envelope, mode: Mode, reason: NakReason) -> Envelope {
    envelope
        .reply(Command::RexecNak(mode), "ACTIVITY")
        .with_args(vec![Value::from(reason.wire())])
}
