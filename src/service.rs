//! Host-facing execution service.
//!
//! Ties the provisioner, the job registry and the per-job engines together
//! behind the operations a host calls: start a snap, talk to it, stop it.
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::ProxyChannel;
use crate::config::ServiceConfig;
use crate::engine::{JobEngine, PendingRequests, Subscriber};
use crate::error::{ExecutionError, Result};
use crate::hooks::ProviderHooks;
use crate::permissions::PermissionGate;
use crate::protocol::{Command, JobId, RpcError, RpcMessage};
use crate::provisioner::{Environment, Provisioner};
use crate::registry::{Job, JobInfo, JobStatus, Registry, ServiceEvent};
use crate::transport::EnvironmentFactory;

/// Capacity of the service event broadcast; slow receivers lag, they never
/// block the service.
const EVENT_CAPACITY: usize = 256;

/// What the host asks to run.
#[derive(Debug, Clone)]
pub struct ExecutionPayload {
    pub snap_id: String,
    pub source_code: String,
    /// Globals the snap is allowed to see
    pub endowments: Vec<String>,
}

/// The execution service.
///
/// Owns the job registry and the environment provisioner; every job shares
/// the one environment's transport through its own proxy channel.
pub struct ExecutionService {
    config: ServiceConfig,
    registry: Arc<Registry>,
    provisioner: Provisioner,
    hooks: Arc<ProviderHooks>,
    gate: Arc<dyn PermissionGate>,
}

impl ExecutionService {
    pub fn new(
        factory: Arc<dyn EnvironmentFactory>,
        config: ServiceConfig,
        hooks: Arc<ProviderHooks>,
        gate: Arc<dyn PermissionGate>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Registry::new(events));
        let provisioner = Provisioner::new(factory, registry.clone());
        Self {
            config,
            registry,
            provisioner,
            hooks,
            gate,
        }
    }

    /// Creates a job and starts the snap in it.
    ///
    /// Returns as soon as the `executeSnap` command is on the wire; use
    /// [`wait_ready`](Self::wait_ready) to wait for the sandbox to confirm.
    pub async fn create_job(&self, payload: ExecutionPayload) -> Result<JobId> {
        if self.registry.job_for_snap(&payload.snap_id).is_some() {
            return Err(ExecutionError::SnapAlreadyRunning(payload.snap_id));
        }

        let environment = self.provisioner.ensure_environment().await?;

        let job_id = JobId::generate();
        let (channel, inbox) = ProxyChannel::new(job_id.clone(), environment.transport().clone());
        let channel = Arc::new(channel);
        let pending = Arc::new(PendingRequests::default());
        let subscriber = Arc::new(Subscriber::default());

        self.registry.insert(Job::new(
            job_id.clone(),
            payload.snap_id.clone(),
            channel.clone(),
            Arc::downgrade(&environment),
            pending.clone(),
            subscriber.clone(),
        ))?;

        let engine = JobEngine {
            job_id: job_id.clone(),
            snap_id: payload.snap_id.clone(),
            channel: channel.clone(),
            pending: pending.clone(),
            hooks: self.hooks.clone(),
            subscriber,
            registry: self.registry.clone(),
        };
        tokio::spawn(engine.run(inbox));

        info!(
            "Created job {job_id} for snap {} (environment generation {})",
            payload.snap_id,
            environment.generation()
        );

        let request = RpcMessage::request(
            Command::ExecuteSnap,
            Some(json!({
                "snapId": payload.snap_id,
                "sourceCode": payload.source_code,
                "endowments": payload.endowments,
                "hooks": self.hooks.names(),
            })),
        );
        let request_id = request.id.clone().unwrap_or_default();
        let response = pending.register(request_id.clone());

        if let Err(e) = channel.write(request) {
            pending.forget(&request_id);
            warn!("Could not start snap {} in job {job_id}: {e}", payload.snap_id);
            if let Err(term) = self.registry.terminate(&job_id) {
                warn!("Cleanup of job {job_id} failed: {term}");
            }
            return Err(e);
        }

        tokio::spawn(await_execution(
            self.registry.clone(),
            job_id.clone(),
            payload.snap_id,
            response,
        ));
        Ok(job_id)
    }

    /// Waits until the job is running.
    pub async fn wait_ready(&self, job_id: &JobId, timeout: Duration) -> Result<()> {
        let mut readiness = self.registry.readiness(job_id)?;

        let reached = tokio::time::timeout(
            timeout,
            readiness
                .status
                .wait_for(|status| *status != JobStatus::Pending),
        )
        .await;

        let status = match reached {
            Err(_) => {
                return Err(ExecutionError::Timeout {
                    job_id: job_id.clone(),
                    timeout,
                })
            }
            Ok(Ok(status)) => *status,
            Ok(Err(_)) => JobStatus::Terminated,
        };

        if status == JobStatus::Running {
            return Ok(());
        }
        Err(match readiness.failure.get() {
            Some(error) => ExecutionError::Rpc(error.clone()),
            None => ExecutionError::ChannelClosed(job_id.clone()),
        })
    }

    /// `create_job` + `wait_ready` bounded by the init timeout. A snap that
    /// does not come up is terminated.
    pub async fn execute_snap(&self, payload: ExecutionPayload) -> Result<JobId> {
        let snap_id = payload.snap_id.clone();
        let job_id = self.create_job(payload).await?;

        if let Err(e) = self.wait_ready(&job_id, self.config.init_timeout()).await {
            warn!("Snap {snap_id} did not start: {e}");
            if let Err(term) = self.terminate_job(&job_id) {
                warn!("Cleanup of job {job_id} failed: {term}");
            }
            return Err(e);
        }

        info!("Snap {snap_id} is running in job {job_id}");
        Ok(job_id)
    }

    /// Inbound application messages for a job, from now on. One subscriber
    /// per job; while none is attached, snap calls that no provider hook
    /// handles are answered with "method not found".
    pub fn subscribe(&self, job_id: &JobId) -> Result<mpsc::UnboundedReceiver<RpcMessage>> {
        self.registry.attach_subscriber(job_id)
    }

    /// Writes an application message through the job's channel.
    pub fn send_command(&self, job_id: &JobId, message: RpcMessage) -> Result<()> {
        let channel = self.registry.channel(job_id)?;
        message.classify()?;
        channel.write(message)
    }

    /// Best-effort, idempotent shutdown of one job.
    pub fn terminate_job(&self, job_id: &JobId) -> Result<()> {
        self.registry.terminate(job_id)
    }

    pub fn terminate_snap(&self, snap_id: &str) -> Result<()> {
        match self.registry.job_for_snap(snap_id) {
            Some(job_id) => self.terminate_job(&job_id),
            None => {
                debug!("Snap {snap_id} is not running");
                Ok(())
            }
        }
    }

    pub fn terminate_all(&self) {
        let jobs = self.registry.job_ids();
        if !jobs.is_empty() {
            info!("Terminating {} job(s)", jobs.len());
        }
        for job_id in jobs {
            if let Err(e) = self.terminate_job(&job_id) {
                warn!("Terminating job {job_id}: {e}");
            }
        }
    }

    /// Forwards a host request into a snap and waits for its answer.
    pub async fn handle_rpc_request(
        &self,
        snap_id: &str,
        origin: &str,
        request: Value,
    ) -> Result<Value> {
        let job_id = self
            .registry
            .job_for_snap(snap_id)
            .ok_or_else(|| ExecutionError::SnapNotRunning(snap_id.to_string()))?;

        self.gate
            .authorize(snap_id, origin, &request)
            .await
            .map_err(ExecutionError::Unauthorized)?;

        self.request(
            &job_id,
            Command::SnapRpc,
            Some(json!({ "origin": origin, "request": request })),
            self.config.request_timeout(),
        )
        .await
    }

    /// Liveness check. Returns the round-trip time.
    pub async fn ping_job(&self, job_id: &JobId) -> Result<Duration> {
        let started = Instant::now();
        self.request(job_id, Command::Ping, None, self.config.ping_timeout())
            .await?;
        Ok(started.elapsed())
    }

    async fn request(
        &self,
        job_id: &JobId,
        command: Command,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (channel, pending) = self.registry.rpc_handles(job_id)?;
        let message = RpcMessage::request(command, params);
        let id = message.id.clone().unwrap_or_default();
        let response = pending.register(id.clone());

        if let Err(e) = channel.write(message) {
            pending.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ExecutionError::Rpc(error)),
            // Waiter dropped: the job was terminated mid-request.
            Ok(Err(_)) => Err(ExecutionError::ChannelClosed(job_id.clone())),
            Err(_) => {
                pending.forget(&id);
                Err(ExecutionError::Timeout {
                    job_id: job_id.clone(),
                    timeout,
                })
            }
        }
    }

    pub fn job_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.registry.status(job_id)
    }

    pub fn job_for_snap(&self, snap_id: &str) -> Option<JobId> {
        self.registry.job_for_snap(snap_id)
    }

    /// Live jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.registry.list()
    }

    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.registry.subscribe_events()
    }

    /// The shared environment, if one is up.
    pub fn environment(&self) -> Option<Arc<Environment>> {
        self.provisioner.current()
    }

    /// Explicit recovery after the environment was lost: every job is torn
    /// down and the next `create_job` provisions a fresh environment.
    pub fn recover_environment(&self) {
        warn!("Recovering execution environment");
        self.terminate_all();
        self.provisioner.teardown();
    }

    /// Process-level shutdown.
    pub fn shutdown(&self) {
        info!("Shutting down execution service");
        self.terminate_all();
        self.provisioner.teardown();
    }
}

/// Waits for the sandbox's answer to `executeSnap`: success means the job is
/// running, an error means it never will be.
async fn await_execution(
    registry: Arc<Registry>,
    job_id: JobId,
    snap_id: String,
    response: oneshot::Receiver<std::result::Result<Value, RpcError>>,
) {
    match response.await {
        Ok(Ok(_)) => registry.mark_running(&job_id),
        Ok(Err(error)) => {
            warn!("Snap {snap_id} failed to execute in job {job_id}: {error}");
            registry.publish(ServiceEvent::UnhandledError {
                snap_id,
                error: serde_json::to_value(&error).unwrap_or(Value::Null),
            });
            registry.record_failure(&job_id, error);
            if let Err(e) = registry.terminate(&job_id) {
                warn!("Cleanup of job {job_id} failed: {e}");
            }
        }
        Err(_) => debug!("Job {job_id} ended before its snap finished executing"),
    }
}
