//! In-memory transport for unit and integration testing.
//!
//! [`MemoryTransport`] opens no sockets. It records every outbound message
//! and every channel opened or closed, so tests can drive a [`Broker`]
//! through its [`Dispatcher`](crate::dispatcher::Dispatcher) and assert on
//! what would have gone over the wire.
//!
//! # Example
//!
//! ```ignore
//! let (broker, transport) = test_broker(BrokerConfig::default());
//! let run_id = broker.remote_async_exec("scan", vec![], "expr").await?;
//! broker.publish_tick().await;
//! assert_eq!(transport.published().len(), 1);
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::transport::{PublishChannel, Transport};

#[derive(Debug, Default)]
struct Recorded {
    published: Vec<(PublishChannel, Envelope)>,
    request_ports: Vec<u16>,
    open_surveys: BTreeSet<u16>,
    survey_messages: Vec<(u16, Envelope)>,
    closed_surveys: Vec<u16>,
    fail_binds: bool,
    hold_survey_binds: bool,
    pending_survey_binds: usize,
}

/// Recording [`Transport`] with optional bind failure injection.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    recorded: Mutex<Recorded>,
    survey_bind_gate: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `bind_request` and `bind_survey` fail.
    pub fn fail_binds(&self, fail: bool) {
        self.recorded.lock().fail_binds = fail;
    }

    /// Make subsequent `bind_survey` calls wait for [`release_survey_bind`](Self::release_survey_bind).
    pub fn hold_survey_binds(&self, hold: bool) {
        self.recorded.lock().hold_survey_binds = hold;
    }

    /// Let one held `bind_survey` complete.
    pub fn release_survey_bind(&self) {
        self.survey_bind_gate.notify_one();
    }

    /// Number of `bind_survey` calls currently held.
    pub fn pending_survey_binds(&self) -> usize {
        self.recorded.lock().pending_survey_binds
    }

    /// Every broadcast sent so far, in order.
    pub fn published(&self) -> Vec<(PublishChannel, Envelope)> {
        self.recorded.lock().published.clone()
    }

    /// `cmd` of every broadcast sent so far.
    pub fn published_commands(&self) -> Vec<String> {
        self.recorded
            .lock()
            .published
            .iter()
            .map(|(_, envelope)| envelope.cmd.clone())
            .collect()
    }

    /// Request channels opened so far.
    pub fn request_ports(&self) -> Vec<u16> {
        self.recorded.lock().request_ports.clone()
    }

    /// Survey channels currently open, ascending.
    pub fn open_surveys(&self) -> Vec<u16> {
        self.recorded.lock().open_surveys.iter().copied().collect()
    }

    /// Survey questions sent so far with the port they went out on.
    pub fn survey_messages(&self) -> Vec<(u16, Envelope)> {
        self.recorded.lock().survey_messages.clone()
    }

    /// Survey channels closed so far, in order.
    pub fn closed_surveys(&self) -> Vec<u16> {
        self.recorded.lock().closed_surveys.clone()
    }

    fn bind_failure(port: u16) -> BrokerError {
        BrokerError::Transport {
            reason: format!("injected bind failure on port {port}"),
            source: None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind_request(&self, port: u16) -> Result<(), BrokerError> {
        let mut recorded = self.recorded.lock();
        if recorded.fail_binds {
            return Err(Self::bind_failure(port));
        }
        recorded.request_ports.push(port);
        Ok(())
    }

    async fn publish(
        &self,
        channel: PublishChannel,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        self.recorded
            .lock()
            .published
            .push((channel, envelope.clone()));
        Ok(())
    }

    async fn bind_survey(&self, port: u16) -> Result<(), BrokerError> {
        let hold = {
            let mut recorded = self.recorded.lock();
            if recorded.hold_survey_binds {
                recorded.pending_survey_binds += 1;
            }
            recorded.hold_survey_binds
        };
        if hold {
            self.survey_bind_gate.notified().await;
            self.recorded.lock().pending_survey_binds -= 1;
        }
        let mut recorded = self.recorded.lock();
        if recorded.fail_binds {
            return Err(Self::bind_failure(port));
        }
        recorded.open_surveys.insert(port);
        Ok(())
    }

    async fn survey(&self, port: u16, envelope: &Envelope) -> Result<(), BrokerError> {
        let mut recorded = self.recorded.lock();
        if !recorded.open_surveys.contains(&port) {
            return Err(BrokerError::Transport {
                reason: format!("survey channel {port} is not open"),
                source: None,
            });
        }
        recorded.survey_messages.push((port, envelope.clone()));
        Ok(())
    }

    async fn close_survey(&self, port: u16) {
        let mut recorded = self.recorded.lock();
        if recorded.open_surveys.remove(&port) {
            recorded.closed_surveys.push(port);
        }
    }
}

/// A broker over a fresh [`MemoryTransport`] with unregistered metrics.
///
/// # Panics
///
/// Panics if `config` does not validate.
pub fn test_broker(config: BrokerConfig) -> (Broker, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let broker = Broker::new(
        config,
        transport.clone(),
        Arc::new(BrokerMetrics::unregistered()),
    )
    .expect("test broker config should be valid");
    (broker, transport)
}
