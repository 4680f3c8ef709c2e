/// In-process environment.
///
/// The sandbox side is plain Rust code holding a [`LoopbackRemote`]: it sees
/// every envelope the host writes and can push envelopes back. Used to embed
/// an interpreter in the host process, and to drive the service in tests
/// without spawning a sandbox host.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChannelTransport, Connection, EnvironmentFactory, TransportEvent, EVENT_QUEUE_CAPACITY};
use crate::error::{EnvironmentError, TransportError};
use crate::protocol::{Envelope, RpcError, RpcMessage};

pub struct LoopbackEnvironment {
    remotes: mpsc::UnboundedSender<LoopbackRemote>,
}

impl LoopbackEnvironment {
    /// Returns the factory and the stream on which the sandbox side of every
    /// created environment is handed out.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoopbackRemote>) {
        let (remotes, remote_rx) = mpsc::unbounded_channel();
        (Self { remotes }, remote_rx)
    }
}

#[async_trait]
impl EnvironmentFactory for LoopbackEnvironment {
    fn kind(&self) -> &str {
        "loopback"
    }

    async fn create(&self) -> Result<Connection, EnvironmentError> {
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Envelope>();
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE_CAPACITY);

        let remote = LoopbackRemote {
            outbound: write_rx,
            inbound: event_tx,
        };
        self.remotes
            .send(remote)
            .map_err(|_| EnvironmentError::Unavailable("no sandbox side is listening".into()))?;

        Ok(Connection {
            transport: Arc::new(ChannelTransport::new(write_tx)),
            events: event_rx,
        })
    }
}

/// Sandbox side of a loopback environment. Dropping it looks like a
/// sandbox crash to the host: writes start failing and the inbound stream
/// ends.
pub struct LoopbackRemote {
    outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::Sender<TransportEvent>,
}

impl LoopbackRemote {
    /// Next envelope written by the host.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }

    /// Pushes an envelope to the host.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.inbound
            .send(TransportEvent::Message(envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Answers a request envelope with a result.
    pub async fn reply(&self, request: &Envelope, result: Value) -> Result<(), TransportError> {
        let id = request.data.id.clone().unwrap_or_default();
        self.send(Envelope::new(
            request.job_id.clone(),
            RpcMessage::response(id, result),
        ))
        .await
    }

    /// Answers a request envelope with an error.
    pub async fn reply_error(&self, request: &Envelope, error: RpcError) -> Result<(), TransportError> {
        let id = request.data.id.clone().unwrap_or_default();
        self.send(Envelope::new(
            request.job_id.clone(),
            RpcMessage::error_response(id, error),
        ))
        .await
    }

    /// Reports a fatal transport failure to the host and drops the remote.
    pub async fn crash(self, reason: &str) {
        let _ = self
            .inbound
            .send(TransportEvent::Closed(reason.to_string()))
            .await;
    }

    /// Splits into the host-to-sandbox stream and the sandbox-to-host sink,
    /// for sandbox code that reads and writes from different tasks.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::Sender<TransportEvent>,
    ) {
        (self.outbound, self.inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, JobId};
    use serde_json::json;

    #[tokio::test]
    async fn test_each_create_hands_out_a_remote() {
        let (factory, mut remotes) = LoopbackEnvironment::new();
        let _a = factory.create().await.unwrap();
        let _b = factory.create().await.unwrap();
        assert!(remotes.try_recv().is_ok());
        assert!(remotes.try_recv().is_ok());
        assert!(remotes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_fails_without_listener() {
        let (factory, remotes) = LoopbackEnvironment::new();
        drop(remotes);
        assert!(matches!(
            factory.create().await,
            Err(EnvironmentError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_echoes_correlation_id() {
        let (factory, mut remotes) = LoopbackEnvironment::new();
        let mut conn = factory.create().await.unwrap();
        let mut remote = remotes.recv().await.unwrap();

        let request = Envelope::new(JobId::from("j"), RpcMessage::request(Command::Ping, None));
        conn.transport.write(request.clone()).unwrap();
        let seen = remote.recv().await.unwrap();
        assert_eq!(seen, request);

        remote.reply(&seen, json!("OK")).await.unwrap();
        match conn.events.recv().await {
            Some(TransportEvent::Message(response)) => {
                assert_eq!(response.job_id, request.job_id);
                assert_eq!(response.data.id, request.data.id);
                assert_eq!(response.data.result, Some(json!("OK")));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_remote_closes_transport() {
        let (factory, mut remotes) = LoopbackEnvironment::new();
        let mut conn = factory.create().await.unwrap();
        drop(remotes.recv().await.unwrap());

        assert!(conn.transport.is_closed());
        assert!(conn.events.recv().await.is_none());
    }
}
