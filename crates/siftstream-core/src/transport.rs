use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// Notifications delivered by a transport to its attached sink, in arrival order.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A chunk of the response body.
    Data(Bytes),
    /// The response body ended. The transport reconnects on its own.
    End { status: Option<u16> },
    /// The transport re-established its connection.
    Recovered { reason: String },
}

/// A resilient long-lived streaming connection.
///
/// `start` is idempotent. `recover` tears down whatever connection exists
/// and opens a fresh one. `write` sends bytes up the open request body.
/// Every event goes to the single sink installed by `attach`; a later
/// `attach` replaces it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self) -> Result<(), TransportError>;
    async fn recover(&self) -> Result<(), TransportError>;

    fn write(&self, message: &str) -> Result<(), TransportError>;
    fn started(&self) -> bool;

    /// Install the sink that receives data/end/recovered notifications.
    fn attach(&self, sink: mpsc::UnboundedSender<TransportEvent>);
}
