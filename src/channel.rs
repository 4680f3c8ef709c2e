//! Proxy channel: a per-job virtual channel multiplexed over the shared
//! transport.
//!
//! Writes are tagged with the bound job id. Reads are push-delivered by the
//! demultiplexer into the job's inbox, in transport order. After `close()`
//! writes fail and new deliveries are refused; messages already sitting in
//! the inbox can still be drained by the job's consumer.
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ExecutionError, ProtocolViolation};
use crate::lock;
use crate::protocol::{Envelope, JobId, RpcMessage};
use crate::transport::Transport;

struct ChannelState {
    open: bool,
    inbox: Option<mpsc::UnboundedSender<RpcMessage>>,
}

pub struct ProxyChannel {
    job_id: JobId,
    transport: Arc<dyn Transport>,
    // The closed check and the transport enqueue happen under this lock, so
    // nothing written through the channel can land behind a terminate
    // command written after close().
    state: Mutex<ChannelState>,
}

impl ProxyChannel {
    /// Creates a channel bound to `job_id` and returns the receiving end of
    /// its inbox.
    pub fn new(
        job_id: JobId,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let channel = Self {
            job_id,
            transport,
            state: Mutex::new(ChannelState {
                open: true,
                inbox: Some(inbox_tx),
            }),
        };
        (channel, inbox_rx)
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Tags `message` with the bound job id and hands it to the transport.
    pub fn write(&self, message: RpcMessage) -> Result<(), ExecutionError> {
        let state = lock(&self.state);
        if !state.open {
            return Err(ExecutionError::ChannelClosed(self.job_id.clone()));
        }
        self.transport
            .write(Envelope::new(self.job_id.clone(), message))?;
        Ok(())
    }

    /// Delivery hook called by the demultiplexer.
    ///
    /// Returns `Ok(false)` when the channel is already closed and the
    /// message was dropped.
    pub fn deliver(&self, envelope: Envelope) -> Result<bool, ProtocolViolation> {
        if envelope.job_id != self.job_id {
            return Err(ProtocolViolation::JobMismatch {
                expected: self.job_id.clone(),
                actual: envelope.job_id,
            });
        }

        let state = lock(&self.state);
        match state.inbox.as_ref() {
            Some(inbox) if state.open => Ok(inbox.send(envelope.data).is_ok()),
            _ => {
                debug!("Channel for job {} is closed, dropping message", self.job_id);
                Ok(false)
            }
        }
    }

    /// Closes the channel. Returns true only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.open {
            return false;
        }
        state.open = false;
        state.inbox = None;
        true
    }

    pub fn is_closed(&self) -> bool {
        !lock(&self.state).open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::Command;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    fn channel(job: &str) -> (
        ProxyChannel,
        mpsc::UnboundedReceiver<RpcMessage>,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (tx, wire) = mpsc::unbounded_channel();
        let (channel, inbox) = ProxyChannel::new(JobId::from(job), Arc::new(ChannelTransport::new(tx)));
        (channel, inbox, wire)
    }

    #[test]
    fn test_write_tags_job_id() {
        let (channel, _inbox, mut wire) = channel("job-a");
        let message = RpcMessage::request(Command::SnapRpc, Some(json!({"n": 1})));
        channel.write(message.clone()).unwrap();

        let envelope = wire.try_recv().unwrap();
        assert_eq!(envelope.job_id, JobId::from("job-a"));
        assert_eq!(envelope.data, message);
    }

    #[test]
    fn test_writes_keep_submission_order() {
        let (channel, _inbox, mut wire) = channel("job-a");
        let sent: Vec<RpcMessage> = (0..3)
            .map(|n| RpcMessage::request(Command::SnapRpc, Some(json!(n))))
            .collect();
        for message in &sent {
            channel.write(message.clone()).unwrap();
        }
        let seen: Vec<RpcMessage> = std::iter::from_fn(|| wire.try_recv().ok())
            .map(|e| e.data)
            .collect();
        assert_eq!(seen, sent);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (channel, _inbox, mut wire) = channel("job-a");
        assert!(channel.close());
        let result = channel.write(RpcMessage::request(Command::Ping, None));
        assert!(matches!(result, Err(ExecutionError::ChannelClosed(id)) if id.as_str() == "job-a"));
        assert!(wire.try_recv().is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (channel, _inbox, _wire) = channel("job-a");
        assert!(!channel.is_closed());
        assert!(channel.close());
        assert!(!channel.close());
        assert!(channel.is_closed());
    }

    #[test]
    fn test_write_surfaces_transport_failure() {
        let (channel, _inbox, wire) = channel("job-a");
        drop(wire);
        let result = channel.write(RpcMessage::request(Command::Ping, None));
        assert!(matches!(
            result,
            Err(ExecutionError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn test_deliver_in_order() {
        let (channel, mut inbox, _wire) = channel("job-a");
        for n in 0..3 {
            let envelope = Envelope::new(
                JobId::from("job-a"),
                RpcMessage::response(n.to_string(), json!(n)),
            );
            assert_eq!(channel.deliver(envelope), Ok(true));
        }
        let ids: Vec<String> = std::iter::from_fn(|| inbox.try_recv().ok())
            .filter_map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_deliver_rejects_foreign_job() {
        let (channel, mut inbox, _wire) = channel("job-a");
        let envelope = Envelope::new(JobId::from("job-b"), RpcMessage::response("1", json!(1)));
        assert_eq!(
            channel.deliver(envelope),
            Err(ProtocolViolation::JobMismatch {
                expected: JobId::from("job-a"),
                actual: JobId::from("job-b"),
            })
        );
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_close_keeps_already_delivered_messages() {
        let (channel, mut inbox, _wire) = channel("job-a");
        let first = Envelope::new(JobId::from("job-a"), RpcMessage::response("1", json!(1)));
        let second = Envelope::new(JobId::from("job-a"), RpcMessage::response("2", json!(2)));

        assert_eq!(channel.deliver(first), Ok(true));
        channel.close();
        assert_eq!(channel.deliver(second), Ok(false));

        assert_eq!(inbox.try_recv().unwrap().id.as_deref(), Some("1"));
        // Inbox sender was dropped by close(): the stream ends after the backlog.
        assert!(matches!(
            inbox.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
