//! The seam between the session controller and a concrete voice provider.

use crate::error::SessionError;
use crate::generic_types::{GenericClientEvent, GenericServerEvent, GenericSessionConfig};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A live provider connection.
///
/// Dropping `tx` asks the provider task to close the socket and finish;
/// `rx` always ends with a `GenericServerEvent::Closed`.
#[derive(Debug)]
pub struct RealtimeLink {
    pub tx: mpsc::Sender<GenericClientEvent>,
    pub rx: mpsc::Receiver<GenericServerEvent>,
    pub handle: JoinHandle<()>,
}

#[async_trait]
pub trait RealtimeApi: Send + Sync {
    /// Opens the socket and sends the setup message. Completion of the
    /// handshake is reported later as `GenericServerEvent::Ready`.
    async fn connect(&self, config: GenericSessionConfig) -> Result<RealtimeLink, SessionError>;
}
