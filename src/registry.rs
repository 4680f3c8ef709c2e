//! Job table.
//!
//! Every mutation (creation, readiness, termination) goes through the one
//! mutex here, so jobs starting and stopping concurrently cannot lose
//! updates. The lock is never held across an await.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::channel::ProxyChannel;
use crate::engine::{PendingRequests, Subscriber};
use crate::error::{ExecutionError, Result};
use crate::lock;
use crate::protocol::{Command, Envelope, JobId, RpcError, RpcMessage};
use crate::provisioner::{Demultiplexer, Environment};

/// Job lifecycle. `Terminated` is absorbing: the job leaves the table right
/// after reaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Environment ready, snap not yet executed
    Pending,
    Running,
    Terminating,
    Terminated,
}

/// Snapshot of a live job
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub snap_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Notifications published by the execution service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    JobReady { job_id: JobId, snap_id: String },
    JobTerminated { job_id: JobId, snap_id: String },
    OutboundRequest { snap_id: String },
    OutboundResponse { snap_id: String },
    UnhandledError { snap_id: String, error: Value },
    /// The shared transport died. Jobs stay registered until the host
    /// recovers the environment or terminates them.
    EnvironmentLost { generation: u64, reason: String },
}

pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) snap_id: String,
    pub(crate) channel: Arc<ProxyChannel>,
    /// Jobs reference the environment, they never own it.
    pub(crate) environment: Weak<Environment>,
    pub(crate) pending: Arc<PendingRequests>,
    status: Arc<watch::Sender<JobStatus>>,
    failure: Arc<OnceLock<RpcError>>,
    subscriber: Arc<Subscriber>,
    created_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        snap_id: String,
        channel: Arc<ProxyChannel>,
        environment: Weak<Environment>,
        pending: Arc<PendingRequests>,
        subscriber: Arc<Subscriber>,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Pending);
        Self {
            id,
            snap_id,
            channel,
            environment,
            pending,
            status: Arc::new(status),
            failure: Arc::new(OnceLock::new()),
            subscriber,
            created_at: Utc::now(),
        }
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            snap_id: self.snap_id.clone(),
            status: *self.status.borrow(),
            created_at: self.created_at,
        }
    }
}

/// What a caller waiting for readiness needs.
pub(crate) struct Readiness {
    pub(crate) status: watch::Receiver<JobStatus>,
    pub(crate) failure: Arc<OnceLock<RpcError>>,
}

pub(crate) struct Registry {
    jobs: Mutex<HashMap<JobId, Job>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Registry {
    pub(crate) fn new(events: broadcast::Sender<ServiceEvent>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn publish(&self, event: ServiceEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Registers a job. At most one live job per snap.
    pub(crate) fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        if jobs.values().any(|existing| existing.snap_id == job.snap_id) {
            return Err(ExecutionError::SnapAlreadyRunning(job.snap_id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub(crate) fn channel(&self, job_id: &JobId) -> Result<Arc<ProxyChannel>> {
        lock(&self.jobs)
            .get(job_id)
            .map(|job| job.channel.clone())
            .ok_or_else(|| ExecutionError::UnknownJob(job_id.clone()))
    }

    pub(crate) fn rpc_handles(
        &self,
        job_id: &JobId,
    ) -> Result<(Arc<ProxyChannel>, Arc<PendingRequests>)> {
        lock(&self.jobs)
            .get(job_id)
            .map(|job| (job.channel.clone(), job.pending.clone()))
            .ok_or_else(|| ExecutionError::UnknownJob(job_id.clone()))
    }

    pub(crate) fn readiness(&self, job_id: &JobId) -> Result<Readiness> {
        lock(&self.jobs)
            .get(job_id)
            .map(|job| Readiness {
                status: job.status.subscribe(),
                failure: job.failure.clone(),
            })
            .ok_or_else(|| ExecutionError::UnknownJob(job_id.clone()))
    }

    pub(crate) fn attach_subscriber(
        &self,
        job_id: &JobId,
    ) -> Result<mpsc::UnboundedReceiver<RpcMessage>> {
        let jobs = lock(&self.jobs);
        let job = jobs
            .get(job_id)
            .ok_or_else(|| ExecutionError::UnknownJob(job_id.clone()))?;
        job.subscriber
            .attach()
            .ok_or_else(|| ExecutionError::AlreadySubscribed(job_id.clone()))
    }

    pub(crate) fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        lock(&self.jobs).get(job_id).map(|job| *job.status.borrow())
    }

    pub(crate) fn job_for_snap(&self, snap_id: &str) -> Option<JobId> {
        lock(&self.jobs)
            .values()
            .find(|job| job.snap_id == snap_id)
            .map(|job| job.id.clone())
    }

    pub(crate) fn job_ids(&self) -> Vec<JobId> {
        lock(&self.jobs).keys().cloned().collect()
    }

    pub(crate) fn list(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = lock(&self.jobs).values().map(Job::info).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// `pending -> running`. Any other starting state is left alone.
    pub(crate) fn mark_running(&self, job_id: &JobId) {
        let snap_id = {
            let jobs = lock(&self.jobs);
            let Some(job) = jobs.get(job_id) else {
                return;
            };
            let promoted = job.status.send_if_modified(|status| {
                if *status == JobStatus::Pending {
                    *status = JobStatus::Running;
                    true
                } else {
                    false
                }
            });
            if !promoted {
                return;
            }
            job.snap_id.clone()
        };
        info!("Job {job_id} is running snap {snap_id}");
        self.publish(ServiceEvent::JobReady {
            job_id: job_id.clone(),
            snap_id,
        });
    }

    /// Remembers why a job failed to start, for whoever awaits readiness.
    pub(crate) fn record_failure(&self, job_id: &JobId, error: RpcError) {
        if let Some(job) = lock(&self.jobs).get(job_id) {
            let _ = job.failure.set(error);
        }
    }

    /// Tears a job down. Idempotent: an absent job is already gone.
    ///
    /// The local channel is closed before anything touches the wire, so no
    /// application message reaches a job that is considered dead even when
    /// the terminate command cannot be written. The command itself is
    /// fire-and-forget.
    pub(crate) fn terminate(&self, job_id: &JobId) -> Result<()> {
        let mut jobs = lock(&self.jobs);

        let Some(job) = jobs.get(job_id) else {
            debug!("Job {job_id} is already gone");
            return Ok(());
        };

        job.status.send_replace(JobStatus::Terminating);
        job.channel.close();
        job.pending.cancel_all();

        let outcome = match job.environment.upgrade() {
            Some(environment) => {
                let command = Envelope::new(
                    job_id.clone(),
                    RpcMessage::request(Command::TerminateJob, None),
                );
                if let Err(e) = environment.transport().write(command) {
                    warn!("Terminate command for job {job_id} not delivered: {e}");
                }
                Ok(())
            }
            None => {
                error!("Terminating job {job_id} but its execution environment no longer exists");
                Err(ExecutionError::EnvironmentMissing(job_id.clone()))
            }
        };

        let removed = jobs.remove(job_id);
        drop(jobs);

        if let Some(job) = removed {
            job.status.send_replace(JobStatus::Terminated);
            info!("Job {job_id} terminated (snap {})", job.snap_id);
            self.publish(ServiceEvent::JobTerminated {
                job_id: job.id,
                snap_id: job.snap_id,
            });
        }

        outcome
    }
}

impl Demultiplexer for Registry {
    fn route(&self, envelope: Envelope) {
        let channel = lock(&self.jobs)
            .get(&envelope.job_id)
            .map(|job| job.channel.clone());

        match channel {
            Some(channel) => {
                if let Err(violation) = channel.deliver(envelope) {
                    warn!("Dropping inbound message: {violation}");
                }
            }
            // The job may have been torn down already.
            None => debug!("Dropping message for unknown job {}", envelope.job_id),
        }
    }

    fn transport_lost(&self, generation: u64, reason: &str) {
        let affected = lock(&self.jobs).len();
        warn!(
            "Execution environment generation {generation} lost ({reason}), {affected} job(s) affected"
        );
        self.publish(ServiceEvent::EnvironmentLost {
            generation,
            reason: reason.to_string(),
        });
    }
}
