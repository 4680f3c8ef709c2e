//! Environment provisioning.
//!
//! The shared sandbox environment is created lazily, exactly once, no matter
//! how many callers ask for it concurrently. The first caller starts creation
//! and parks a [`Shared`] future in the slot; everyone arriving before it
//! resolves awaits that same future. On failure every waiter sees the same
//! error and the slot is cleared so a later call can retry.
//!
//! Nothing here recreates a failed environment on its own. Recovery is an
//! explicit [`Provisioner::teardown`] by the host followed by a new
//! `ensure_environment`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EnvironmentError;
use crate::lock;
use crate::protocol::Envelope;
use crate::transport::{Connection, EnvironmentFactory, Transport, TransportEvent};

/// Receiver of everything arriving on the shared transport.
pub trait Demultiplexer: Send + Sync {
    fn route(&self, envelope: Envelope);

    /// The transport of environment `generation` is gone.
    fn transport_lost(&self, generation: u64, reason: &str);
}

/// The live sandbox environment: one transport shared by every job, plus
/// the pump feeding inbound messages to the demultiplexer.
pub struct Environment {
    generation: u64,
    kind: String,
    transport: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

impl Environment {
    fn start(
        generation: u64,
        kind: String,
        connection: Connection,
        router: Arc<dyn Demultiplexer>,
    ) -> Self {
        let pump = tokio::spawn(pump(generation, connection.events, router));
        Self {
            generation,
            kind,
            transport: connection.transport,
            pump,
        }
    }

    /// Increments each time a new environment is created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn shutdown(&self) {
        self.transport.close();
        self.pump.abort();
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump(
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    router: Arc<dyn Demultiplexer>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(envelope) => router.route(envelope),
            TransportEvent::Closed(reason) => {
                router.transport_lost(generation, &reason);
                return;
            }
        }
    }
    router.transport_lost(generation, "transport event stream ended");
}

type PendingEnvironment = Shared<BoxFuture<'static, Result<Arc<Environment>, EnvironmentError>>>;

enum Slot {
    Empty,
    Creating {
        generation: u64,
        pending: PendingEnvironment,
    },
    Ready(Arc<Environment>),
}

pub struct Provisioner {
    factory: Arc<dyn EnvironmentFactory>,
    router: Arc<dyn Demultiplexer>,
    slot: Mutex<Slot>,
    generations: AtomicU64,
}

impl Provisioner {
    pub fn new(factory: Arc<dyn EnvironmentFactory>, router: Arc<dyn Demultiplexer>) -> Self {
        Self {
            factory,
            router,
            slot: Mutex::new(Slot::Empty),
            generations: AtomicU64::new(0),
        }
    }

    /// Returns the shared environment, creating it on first use.
    pub async fn ensure_environment(&self) -> Result<Arc<Environment>, EnvironmentError> {
        let (generation, pending) = {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Ready(environment) => return Ok(environment.clone()),
                Slot::Creating {
                    generation,
                    pending,
                } => (*generation, pending.clone()),
                Slot::Empty => {
                    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let pending = self.begin_creation(generation);
                    *slot = Slot::Creating {
                        generation,
                        pending: pending.clone(),
                    };
                    (generation, pending)
                }
            }
        };

        let outcome = pending.await;

        let mut slot = lock(&self.slot);
        let still_current = matches!(
            &*slot,
            Slot::Creating { generation: g, .. } if *g == generation
        );
        if still_current {
            *slot = match &outcome {
                Ok(environment) => Slot::Ready(environment.clone()),
                Err(_) => Slot::Empty,
            };
            return outcome;
        }

        match (&*slot, outcome) {
            (Slot::Ready(environment), Ok(created)) if Arc::ptr_eq(environment, &created) => {
                Ok(created)
            }
            // Teardown ran while this generation was being created.
            (_, Ok(orphan)) => {
                warn!(
                    "Environment generation {} finished after teardown, discarding it",
                    orphan.generation
                );
                orphan.shutdown();
                Err(EnvironmentError::Cancelled)
            }
            (_, Err(e)) => Err(e),
        }
    }

    fn begin_creation(&self, generation: u64) -> PendingEnvironment {
        let factory = self.factory.clone();
        let router = self.router.clone();
        async move {
            let kind = factory.kind().to_string();
            info!("Creating {kind} execution environment (generation {generation})");
            match factory.create().await {
                Ok(connection) => {
                    info!("Execution environment ready (generation {generation})");
                    Ok(Arc::new(Environment::start(
                        generation, kind, connection, router,
                    )))
                }
                Err(e) => {
                    warn!("Failed to create {kind} execution environment: {e}");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// The environment, if one is up.
    pub fn current(&self) -> Option<Arc<Environment>> {
        match &*lock(&self.slot) {
            Slot::Ready(environment) => Some(environment.clone()),
            _ => None,
        }
    }

    /// Releases the environment. Only for process-level shutdown or the
    /// explicit recovery path; jobs never call this.
    pub fn teardown(&self) {
        let previous = std::mem::replace(&mut *lock(&self.slot), Slot::Empty);
        match previous {
            Slot::Ready(environment) => {
                info!(
                    "Tearing down execution environment (generation {})",
                    environment.generation
                );
                environment.shutdown();
            }
            Slot::Creating { generation, .. } => {
                debug!("Teardown while generation {generation} was still being created");
            }
            Slot::Empty => {}
        }
    }
}
