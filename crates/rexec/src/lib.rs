//! Quorum-gated remote execution broker.
//!
//! A control plane dispatches named operations to a fleet of peers over a
//! best-effort broadcast transport. Peers that answer are admitted or told to
//! stand down by an [`AdmissionPolicy`](admission::AdmissionPolicy); once
//! enough have been admitted, a survey round collects their results under a
//! separate threshold.
//!
//! The transport is abstracted behind [`Transport`](transport::Transport);
//! inbound frames are fed to a [`Dispatcher`](dispatcher::Dispatcher).

pub mod activity_store;
pub mod admission;
pub mod broker;
pub mod config;
pub mod device_registry;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod function_registry;
pub mod hash;
pub mod metrics;
pub mod port_pool;
pub mod publish_queue;
pub mod run_table;
pub mod survey;
pub mod testing;
pub mod transport;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::admission::{AdmissionPolicy, Decision};
    pub use crate::broker::{Broker, RunSnapshot};
    pub use crate::config::BrokerConfig;
    pub use crate::dispatcher::{Dispatcher, InboundChannel};
    pub use crate::envelope::{Command, Envelope, Mode};
    pub use crate::error::BrokerError;
    pub use crate::metrics::BrokerMetrics;
    pub use crate::transport::{PublishChannel, Transport};
    pub use crate::types::{DeviceId, RunId, Value};
}
