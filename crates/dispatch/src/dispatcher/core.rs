//! Dispatcher bootstrap and event loop

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, DispatcherConfig, ShutdownMode, TransformationTypeConfig};
use crate::driver::{DriverFactory, DriverRegistry};
use crate::message::{DriverCommand, TransformationReply, WorkerState, WorkerStatus};
use crate::reliability::Backoff;
use crate::transform::Transformation;
use crate::worker::pool::{Pool, PoolFault};
use crate::worker::Tick;

use super::handle::{DispatchError, DispatchRequest, DispatcherHandle};

/// One pool to be created at start, with its factory already resolved
struct PoolSpec {
    type_name: String,
    config: TransformationTypeConfig,
    factory: Arc<dyn DriverFactory>,
}

/// The transformation dispatcher
///
/// Construction validates the configuration against the driver registry;
/// [`start`](Dispatcher::start) spawns the event loop and hands back a
/// [`DispatcherHandle`].
///
/// # Example
///
/// ```
/// use viewflow_dispatch::{
///     Dispatcher, DispatcherConfig, DriverRegistry, ScriptedDriverFactory,
///     TransformationTypeConfig,
/// };
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut registry = DriverRegistry::new();
/// registry.register(ScriptedDriverFactory::new("hive"));
///
/// let config = DispatcherConfig::new()
///     .with_transformation("hive", TransformationTypeConfig::new(2));
///
/// let dispatcher = Dispatcher::new(config, &registry).expect("valid configuration");
/// let handle = dispatcher.start();
/// # handle.shutdown().await.expect("clean shutdown");
/// # }
/// ```
pub struct Dispatcher {
    shutdown_mode: ShutdownMode,
    mailbox_capacity: usize,
    backoff_seed: Option<u64>,
    type_configs: BTreeMap<String, TransformationTypeConfig>,
    pool_specs: Vec<PoolSpec>,
}

impl Dispatcher {
    /// Validate the configuration and resolve every driver factory
    ///
    /// # Errors
    ///
    /// Fatal at startup: a configured type without a registered factory,
    /// a concurrency below 1, or a zero mailbox capacity.
    pub fn new(config: DispatcherConfig, registry: &DriverRegistry) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut pool_specs = Vec::with_capacity(config.transformations.len());
        for (type_name, type_config) in &config.transformations {
            let factory = registry.factory(type_name).map_err(|_| {
                ConfigError::UnknownTransformationType {
                    type_name: type_name.clone(),
                }
            })?;
            pool_specs.push(PoolSpec {
                type_name: type_name.clone(),
                config: type_config.clone(),
                factory,
            });
        }

        Ok(Self {
            shutdown_mode: config.shutdown,
            mailbox_capacity: config.mailbox_capacity,
            backoff_seed: config.backoff_seed,
            type_configs: config.transformations,
            pool_specs,
        })
    }

    /// Spawn the dispatcher loop and its pools
    pub fn start(self) -> DispatcherHandle {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut pools = HashMap::new();
        let mut ticks = HashMap::new();
        let mut worker_types = HashMap::new();

        for spec in &self.pool_specs {
            let pool = Pool::spawn(
                &spec.type_name,
                &spec.config,
                self.mailbox_capacity,
                self.shutdown_mode,
                Arc::clone(&spec.factory),
                status_tx.clone(),
                fault_tx.clone(),
                shutdown_rx.clone(),
            );
            for (worker_id, tick_tx) in pool.tick_senders() {
                ticks.insert(worker_id.to_string(), tick_tx.clone());
                worker_types.insert(worker_id.to_string(), spec.type_name.clone());
            }
            pools.insert(spec.type_name.clone(), pool);
        }

        let core = DispatcherCore {
            pools,
            ticks,
            worker_types,
            type_configs: self.type_configs,
            backoff_seed: self.backoff_seed,
            driver_states: HashMap::new(),
            backoffs: HashMap::new(),
        };

        let task = tokio::spawn(run_loop(core, request_rx, status_rx, fault_rx, shutdown_tx));

        DispatcherHandle {
            requests: request_tx,
            task,
        }
    }
}

/// State owned exclusively by the dispatcher loop
struct DispatcherCore {
    pools: HashMap<String, Pool>,
    ticks: HashMap<String, mpsc::Sender<Tick>>,
    worker_types: HashMap<String, String>,
    type_configs: BTreeMap<String, TransformationTypeConfig>,
    backoff_seed: Option<u64>,
    driver_states: HashMap<String, WorkerStatus>,
    backoffs: HashMap<String, Backoff>,
}

/// The dispatcher event loop
///
/// Never blocks on driver work: routing is a channel send, backoff waits
/// run on detached sleeper tasks, and snapshots are map reads.
#[instrument(skip_all, fields(pools = core.pools.len()))]
async fn run_loop(
    mut core: DispatcherCore,
    mut requests: mpsc::UnboundedReceiver<DispatchRequest>,
    mut statuses: mpsc::UnboundedReceiver<WorkerStatus>,
    mut faults: mpsc::UnboundedReceiver<PoolFault>,
    shutdown: watch::Sender<bool>,
) -> Result<(), DispatchError> {
    info!("dispatcher started");

    // The status and fault arms disable themselves once closed instead of
    // ending the loop, so a pending fault is never masked by the failing
    // worker's channels closing first. The request channel closing is the
    // drop-the-handle shutdown path.
    let result = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(DispatchRequest::Shutdown) | None => break Ok(()),
                Some(request) => core.handle_request(request),
            },
            Some(status) = statuses.recv() => core.manage_driver_lifecycle(status),
            Some(fault) = faults.recv() => {
                error!(
                    pool = %fault.pool_name,
                    worker_id = %fault.worker_id,
                    message = %fault.message,
                    "pool escalated an unrecoverable fault"
                );
                break Err(DispatchError::PoolFault {
                    pool: fault.pool_name,
                    worker_id: fault.worker_id,
                    message: fault.message,
                });
            },
        }
    };

    let _ = shutdown.send(true);
    core.join_pools().await;
    info!("dispatcher stopped");
    result
}

impl DispatcherCore {
    /// Route one inbound request; exhaustive over the message set
    fn handle_request(&mut self, request: DispatchRequest) {
        match request {
            DispatchRequest::Submit(command) => self.route_command(command),

            DispatchRequest::Transform {
                transformation,
                reply,
            } => self.route_command(DriverCommand::Transform {
                transformation,
                view: None,
                reply,
            }),

            DispatchRequest::Materialize { view, reply } => {
                let transformation = view.transformation().for_view(&view);
                self.route_command(DriverCommand::Transform {
                    transformation,
                    view: Some(view),
                    reply,
                });
            }

            DispatchRequest::Filesystem {
                transformation,
                reply,
            } => {
                let transformation: Transformation = transformation.into();
                self.route_command(DriverCommand::Transform {
                    transformation,
                    view: None,
                    reply,
                });
            }

            DispatchRequest::Deploy { ack } => {
                debug!(pools = self.pools.len(), "broadcasting deploy to all pools");
                for pool in self.pools.values() {
                    pool.broadcast(ack.clone());
                }
            }

            DispatchRequest::GetTransformations { reply } => {
                let mut states: Vec<_> = self.driver_states.values().cloned().collect();
                states.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
                let _ = reply.send(states);
            }

            // Handled by the loop before dispatch.
            DispatchRequest::Shutdown => {}
        }
    }

    /// Forward a command to the pool serving its transformation type
    fn route_command(&mut self, command: DriverCommand) {
        match command.transformation_type() {
            Some(type_name) => match self.pools.get(type_name) {
                Some(pool) => {
                    debug!(%type_name, pool = %pool.pool_name(), "routing command");
                    pool.route(command);
                }
                None => {
                    warn!(%type_name, "no pool for transformation type, rejecting command");
                    if let DriverCommand::Transform {
                        transformation,
                        view,
                        reply,
                    } = command
                    {
                        let _ = reply.send(TransformationReply::Failure {
                            view,
                            reason: format!(
                                "unknown transformation type: {}",
                                transformation.transformation_type()
                            ),
                        });
                    }
                }
            },
            // A deploy submitted as a raw command broadcasts everywhere.
            None => {
                if let DriverCommand::Deploy { ack } = command {
                    for pool in self.pools.values() {
                        pool.broadcast(ack.clone());
                    }
                }
            }
        }
    }

    /// Record a worker status and drive the backoff bookkeeping
    ///
    /// A `booted` worker with no backoff entry is on its first boot and is
    /// activated immediately. A re-booting worker advances its backoff and
    /// receives its tick only after the computed wait, so a crash-looping
    /// driver backs off while its siblings keep serving.
    fn manage_driver_lifecycle(&mut self, status: WorkerStatus) {
        let worker_id = status.worker_id.clone();
        let booted = status.state == WorkerState::Booted;
        debug!(%worker_id, state = %status.state, "recorded worker status");
        self.driver_states.insert(worker_id.clone(), status);

        if !booted {
            return;
        }

        match self.backoffs.entry(worker_id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(new_backoff(
                    &self.worker_types,
                    &self.type_configs,
                    self.backoff_seed,
                    &worker_id,
                ));
                debug!(%worker_id, "first boot, activating immediately");
                self.send_tick_now(&worker_id);
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut().next();
                info!(
                    %worker_id,
                    retries = state.retries,
                    resets = state.resets,
                    total_retries = state.total_retries,
                    wait_ms = state.current_wait.as_millis() as u64,
                    "worker re-booted, delaying activation"
                );
                self.send_tick_after(&worker_id, state.current_wait);
            }
        }
    }

    /// Deliver an activation tick without waiting
    fn send_tick_now(&self, worker_id: &str) {
        if let Some(tick) = self.ticks.get(worker_id) {
            if tick.try_send(Tick).is_err() {
                debug!(%worker_id, "activation tick dropped");
            }
        }
    }

    /// Deliver an activation tick after the given wait, off-loop
    fn send_tick_after(&self, worker_id: &str, wait: Duration) {
        if let Some(tick) = self.ticks.get(worker_id) {
            let tick = tick.clone();
            let worker_id = worker_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if tick.send(Tick).await.is_err() {
                    debug!(%worker_id, "activation tick dropped");
                }
            });
        }
    }

    /// Drain every pool after shutdown has been signalled
    async fn join_pools(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.join().await;
        }
    }
}

/// Build the backoff for a worker from its type's configuration
fn new_backoff(
    worker_types: &HashMap<String, String>,
    type_configs: &BTreeMap<String, TransformationTypeConfig>,
    seed: Option<u64>,
    worker_id: &str,
) -> Backoff {
    let config = worker_types
        .get(worker_id)
        .and_then(|type_name| type_configs.get(type_name));

    let (slot, delay, ceiling) = match config {
        Some(config) => (
            config.backoff_slot_time,
            config.backoff_minimum_delay,
            config.retry_ceiling,
        ),
        // Worker ids only come from pools built off the same config, so
        // this arm is unreachable in practice; defaults keep it total.
        None => {
            let defaults = TransformationTypeConfig::default();
            (
                defaults.backoff_slot_time,
                defaults.backoff_minimum_delay,
                defaults.retry_ceiling,
            )
        }
    };

    let backoff = match seed {
        Some(seed) => Backoff::with_seed(slot, delay, seed),
        None => Backoff::new(slot, delay),
    };
    backoff.with_ceiling(ceiling)
}
