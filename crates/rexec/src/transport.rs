use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::BrokerError;

/// Fan-out channels the broker publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishChannel {
    /// Dispatched calls, kills and other fleet-wide messages.
    Devices,
    /// Reserved for a separate peer class; the core never publishes here.
    Clouds,
}

/// Outbound side of the message transport.
///
/// Inbound traffic flows the other way: the transport decodes frames and
/// hands them to the [`Dispatcher`](crate::dispatcher::Dispatcher), sending
/// back whatever reply it returns on request/reply channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a private request/reply channel for a newly registered peer.
    async fn bind_request(&self, port: u16) -> Result<(), BrokerError>;

    /// Best-effort broadcast. Delivery is never confirmed.
    async fn publish(&self, channel: PublishChannel, envelope: &Envelope)
        -> Result<(), BrokerError>;

    /// Open the survey channel of a run.
    async fn bind_survey(&self, port: u16) -> Result<(), BrokerError>;

    /// Send a survey question on an open survey channel.
    async fn survey(&self, port: u16, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Close a survey channel. Closing an unknown port is a no-op.
    async fn close_survey(&self, port: u16);
}
