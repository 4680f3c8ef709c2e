pub mod loopback;
pub mod process;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EnvironmentError, TransportError};
use crate::lock;
use crate::protocol::Envelope;

pub use loopback::{LoopbackEnvironment, LoopbackRemote};
pub use process::ProcessEnvironment;

/// Capacity of the inbound event queue between a transport's reader and
/// the demultiplexer.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Events emitted by a transport to the host
#[derive(Debug)]
pub enum TransportEvent {
    Message(Envelope),
    /// The physical channel is gone (sandbox host exited, pipe broke).
    Closed(String),
}

/// The single physical channel to the sandbox environment.
///
/// `write` only enqueues: it never waits on the remote side, so it is safe
/// to call while holding a short lock. Envelopes written from one task are
/// delivered in the order they were written.
pub trait Transport: Send + Sync {
    fn write(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Stops accepting writes. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// What an environment factory hands back: the write side as a shared
/// [`Transport`], and the inbound event stream (the `onMessage` side).
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// A sandbox flavor (process, in-process loopback, ...).
///
/// The execution service never branches on the kind of sandbox; it only
/// asks the factory for a fresh connection when the shared environment
/// has to be created.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    /// Short name for logs, e.g. `"process"`.
    fn kind(&self) -> &str;

    /// Stands up the sandbox pool and returns its transport.
    async fn create(&self) -> Result<Connection, EnvironmentError>;
}

/// Transport backed by an unbounded mpsc queue drained by a writer task.
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }
}

impl Transport for ChannelTransport {
    fn write(&self, envelope: Envelope) -> Result<(), TransportError> {
        let sender = lock(&self.sender);
        match sender.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        // Dropping the sender lets the writer task drain and exit.
        lock(&self.sender).take();
    }

    fn is_closed(&self) -> bool {
        lock(&self.sender)
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, JobId, RpcMessage};

    fn envelope(job: &str) -> Envelope {
        Envelope::new(JobId::from(job), RpcMessage::request(Command::Ping, None))
    }

    #[test]
    fn test_channel_transport_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx);
        for job in ["a", "b", "c"] {
            transport.write(envelope(job)).unwrap();
        }
        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.job_id.to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_channel_transport_close_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx);
        assert!(!transport.is_closed());
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(transport.write(envelope("a")), Err(TransportError::Closed));
    }

    #[test]
    fn test_channel_transport_reports_dead_reader() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport::new(tx);
        drop(rx);
        assert!(transport.is_closed());
        assert_eq!(transport.write(envelope("a")), Err(TransportError::Closed));
    }
}
