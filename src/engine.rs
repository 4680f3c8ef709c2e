//! Per-job inbound loop.
//!
//! One task per job drains the job's inbox in order. Responses are matched
//! against in-flight requests; sandbox-originated commands are handled here;
//! anything that is application traffic goes to the job's subscriber.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::channel::ProxyChannel;
use crate::error::ProtocolViolation;
use crate::hooks::{HookContext, ProviderHooks};
use crate::lock;
use crate::protocol::{Command, Inbound, JobId, RpcError, RpcMessage, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::registry::{Registry, ServiceEvent};

type Outcome = Result<Value, RpcError>;

/// Requests sent to a job that are waiting for their response.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
}

impl PendingRequests {
    pub(crate) fn register(&self, id: String) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id, tx);
        rx
    }

    /// Returns false if nobody was waiting for `id`.
    pub(crate) fn resolve(&self, id: &str, outcome: Outcome) -> bool {
        match lock(&self.waiters).remove(id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, id: &str) {
        lock(&self.waiters).remove(id);
    }

    /// Drops every waiter; their receivers observe the job going away.
    pub(crate) fn cancel_all(&self) {
        lock(&self.waiters).clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.waiters).len()
    }
}

/// The host's end of a job's application traffic.
///
/// Nothing is queued before the host subscribes: until then (and after the
/// receiver is dropped) unhooked snap calls are rejected instead of piling up.
#[derive(Default)]
pub(crate) struct Subscriber {
    state: Mutex<SubscriberState>,
}

#[derive(Default)]
struct SubscriberState {
    attached: bool,
    sender: Option<mpsc::UnboundedSender<RpcMessage>>,
}

impl Subscriber {
    /// Returns `None` if the job was already subscribed to once.
    pub(crate) fn attach(&self) -> Option<mpsc::UnboundedReceiver<RpcMessage>> {
        let mut state = lock(&self.state);
        if state.attached {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.attached = true;
        state.sender = Some(tx);
        Some(rx)
    }

    /// Hands the message back if nobody is listening.
    pub(crate) fn send(&self, message: RpcMessage) -> Result<(), RpcMessage> {
        let mut state = lock(&self.state);
        let Some(sender) = state.sender.as_ref() else {
            return Err(message);
        };
        match sender.send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(message)) => {
                state.sender = None;
                Err(message)
            }
        }
    }
}

pub(crate) struct JobEngine {
    pub(crate) job_id: JobId,
    pub(crate) snap_id: String,
    pub(crate) channel: Arc<ProxyChannel>,
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) hooks: Arc<ProviderHooks>,
    pub(crate) subscriber: Arc<Subscriber>,
    pub(crate) registry: Arc<Registry>,
}

impl JobEngine {
    /// Runs until the job's channel is closed and its backlog drained.
    pub(crate) async fn run(self, mut inbox: mpsc::UnboundedReceiver<RpcMessage>) {
        while let Some(message) = inbox.recv().await {
            match message.classify() {
                Ok(Inbound::Response { id, outcome }) => {
                    // Late answers to requests that timed out end up here too.
                    if !self.pending.resolve(&id, outcome) {
                        debug!(
                            "Job {}: no request in flight for response {id}, discarding",
                            self.job_id
                        );
                    }
                }
                Ok(Inbound::Request {
                    id,
                    command,
                    params,
                }) => self.handle_request(message, id, command, params),
                Err(violation) => {
                    warn!("Job {}: dropping message: {violation}", self.job_id);
                }
            }
        }
        debug!("Inbound loop for job {} finished", self.job_id);
    }

    fn handle_request(
        &self,
        message: RpcMessage,
        id: Option<String>,
        command: Command,
        params: Option<Value>,
    ) {
        match command {
            Command::ExecuteSnap => {
                let violation = ProtocolViolation::UnexpectedCommand(command.to_string());
                warn!("Job {}: dropping message: {violation}", self.job_id);
            }
            Command::Ping => self.respond(id, Ok(json!("pong"))),
            Command::TerminateJob => {
                info!("Job {} asked to be terminated", self.job_id);
                if let Err(e) = self.registry.terminate(&self.job_id) {
                    warn!("Sandbox-initiated termination of job {}: {e}", self.job_id);
                }
            }
            Command::SnapRpc => self.handle_snap_rpc(message, id, params),
            Command::OutboundRequest => self.registry.publish(ServiceEvent::OutboundRequest {
                snap_id: self.snap_id.clone(),
            }),
            Command::OutboundResponse => self.registry.publish(ServiceEvent::OutboundResponse {
                snap_id: self.snap_id.clone(),
            }),
            Command::UnhandledError => {
                let error = params.unwrap_or(Value::Null);
                error!("Snap {} raised an unhandled error: {error}", self.snap_id);
                self.registry.publish(ServiceEvent::UnhandledError {
                    snap_id: self.snap_id.clone(),
                    error,
                });
            }
        }
    }

    /// Calls from the snap to the host. Provider hooks are answered here;
    /// everything else belongs to the subscriber.
    fn handle_snap_rpc(&self, message: RpcMessage, id: Option<String>, params: Option<Value>) {
        let method = params
            .as_ref()
            .and_then(|p| p.get("method"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let is_hook = method
            .as_deref()
            .is_some_and(|name| self.hooks.get(name).is_some());
        if !is_hook {
            self.forward_or_reject(message, id, method.as_deref());
            return;
        }

        // Hooks may be slow; run them off the inbound loop so later messages
        // for this job (including responses the hook may be waiting on) keep
        // flowing.
        let hooks = self.hooks.clone();
        let channel = self.channel.clone();
        let context = HookContext {
            snap_id: self.snap_id.clone(),
            job_id: self.job_id.clone(),
        };
        let hook_params = params
            .and_then(|mut p| p.get_mut("params").map(Value::take))
            .unwrap_or(Value::Null);
        let name = method.unwrap_or_default();

        tokio::spawn(async move {
            let Some(hook) = hooks.get(&name) else {
                return;
            };
            debug!("Job {}: calling provider hook {name}", context.job_id);
            let outcome = hook
                .call(hook_params, &context)
                .await
                .map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()));
            if let Err(e) = &outcome {
                warn!("Provider hook {name} failed for snap {}: {e}", context.snap_id);
            }
            respond(&channel, id, outcome);
        });
    }

    fn forward_or_reject(&self, message: RpcMessage, id: Option<String>, method: Option<&str>) {
        if self.subscriber.send(message).is_err() {
            let method = method.unwrap_or(Command::SnapRpc.as_str());
            debug!("Job {}: no subscriber for {method}", self.job_id);
            self.respond(
                id,
                Err(RpcError::new(METHOD_NOT_FOUND, format!("no handler for {method}"))),
            );
        }
    }

    fn respond(&self, id: Option<String>, outcome: Outcome) {
        respond(&self.channel, id, outcome);
    }
}

fn respond(channel: &ProxyChannel, id: Option<String>, outcome: Outcome) {
    // Notifications get no response.
    let Some(id) = id else {
        return;
    };
    let message = match outcome {
        Ok(result) => RpcMessage::response(id, result),
        Err(error) => RpcMessage::error_response(id, error),
    };
    if let Err(e) = channel.write(message) {
        debug!("Response for job {} not sent: {e}", channel.job_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_outcome_once() {
        let pending = PendingRequests::default();
        let rx = pending.register("1".into());
        assert!(pending.resolve("1", Ok(json!("OK"))));
        assert!(!pending.resolve("1", Ok(json!("again"))));
        assert_eq!(rx.await.unwrap(), Ok(json!("OK")));
    }

    #[test]
    fn test_resolve_unknown_id() {
        let pending = PendingRequests::default();
        assert!(!pending.resolve("missing", Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiters() {
        let pending = PendingRequests::default();
        let a = pending.register("a".into());
        let b = pending.register("b".into());
        pending.cancel_all();
        assert_eq!(pending.len(), 0);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
    }

    #[test]
    fn test_subscriber_rejects_until_attached() {
        let subscriber = Subscriber::default();
        let message = RpcMessage::notification(Command::SnapRpc, None);
        assert_eq!(subscriber.send(message.clone()), Err(message.clone()));

        let mut rx = subscriber.attach().unwrap();
        assert!(subscriber.attach().is_none());
        assert_eq!(subscriber.send(message.clone()), Ok(()));
        assert_eq!(rx.try_recv().unwrap(), message);

        drop(rx);
        assert_eq!(subscriber.send(message.clone()), Err(message));
        // Dropping the receiver does not allow a second subscription.
        assert!(subscriber.attach().is_none());
    }

    #[test]
    fn test_forget_removes_waiter() {
        let pending = PendingRequests::default();
        let _rx = pending.register("a".into());
        pending.forget("a");
        assert_eq!(pending.len(), 0);
    }
}
