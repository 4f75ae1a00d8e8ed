//! Per-type worker pools
//!
//! A pool is a fixed-size group of workers for one transformation type plus
//! a router task. Routing is smallest-mailbox: the worker with the fewest
//! pending commands wins, ties going to the lowest index. The router runs
//! on its own task so a full mailbox never stalls the dispatcher loop.
//!
//! Supervision is one-for-one: retryable and initialisation faults are
//! absorbed inside the worker slot itself; anything else ends the slot task
//! and a per-worker monitor forwards the fault to the dispatcher.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ShutdownMode, TransformationTypeConfig};
use crate::driver::DriverFactory;
use crate::message::{DeployAck, DriverCommand, WorkerStatus};

use super::{Tick, Worker, WorkerFault};

/// Fault escalated from a pool to the dispatcher
#[derive(Debug)]
pub(crate) struct PoolFault {
    pub(crate) pool_name: String,
    pub(crate) worker_id: String,
    pub(crate) message: String,
}

/// Requests handled by a pool's router task
#[derive(Debug)]
enum PoolRequest {
    /// Route one command to the least-loaded worker
    Route(DriverCommand),

    /// Enqueue a deploy for every worker, exactly once each
    Broadcast(mpsc::UnboundedSender<DeployAck>),
}

/// A fixed-size group of workers for one transformation type
pub(crate) struct Pool {
    type_name: String,
    pool_name: String,
    requests: mpsc::UnboundedSender<PoolRequest>,
    mailboxes: Vec<mpsc::Sender<DriverCommand>>,
    ticks: Vec<(String, mpsc::Sender<Tick>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawn the pool's workers, monitors and router
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        type_name: &str,
        config: &TransformationTypeConfig,
        mailbox_capacity: usize,
        shutdown_mode: ShutdownMode,
        factory: Arc<dyn DriverFactory>,
        status: mpsc::UnboundedSender<WorkerStatus>,
        faults: mpsc::UnboundedSender<PoolFault>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pool_name = format!("{type_name}-pool");
        let mut mailboxes = Vec::with_capacity(config.concurrency);
        let mut ticks = Vec::with_capacity(config.concurrency);
        let mut tasks = Vec::with_capacity(config.concurrency + 1);

        for index in 0..config.concurrency {
            let worker_id = format!("{pool_name}-{index}");
            let (command_tx, command_rx) = mpsc::channel(mailbox_capacity);
            let (tick_tx, tick_rx) = mpsc::channel(4);

            let worker = Worker::new(
                worker_id.clone(),
                Arc::clone(&factory),
                command_rx,
                tick_rx,
                status.clone(),
                config.deploy.clone(),
                config.run_timeout,
                shutdown_mode,
                shutdown.clone(),
            );

            let slot = tokio::spawn(worker.run());
            tasks.push(tokio::spawn(monitor_worker(
                slot,
                pool_name.clone(),
                worker_id.clone(),
                faults.clone(),
            )));
            mailboxes.push(command_tx);
            ticks.push((worker_id, tick_tx));
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(route_requests(
            pool_name.clone(),
            mailboxes.clone(),
            request_rx,
        )));

        info!(
            pool = %pool_name,
            workers = config.concurrency,
            "transformation pool started"
        );

        Self {
            type_name: type_name.to_string(),
            pool_name,
            requests: request_tx,
            mailboxes,
            ticks,
            tasks,
        }
    }

    /// The transformation type this pool serves
    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The pool's name, `"{type_name}-pool"`
    pub(crate) fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Activation channels, one per worker
    pub(crate) fn tick_senders(&self) -> impl Iterator<Item = (&str, &mpsc::Sender<Tick>)> {
        self.ticks.iter().map(|(id, tx)| (id.as_str(), tx))
    }

    /// Hand a command to the router for smallest-mailbox delivery
    pub(crate) fn route(&self, command: DriverCommand) {
        if self.requests.send(PoolRequest::Route(command)).is_err() {
            warn!(pool = %self.pool_name, "router stopped, dropping command");
        }
    }

    /// Enqueue a deploy for every worker in the pool
    pub(crate) fn broadcast(&self, ack: mpsc::UnboundedSender<DeployAck>) {
        if self.requests.send(PoolRequest::Broadcast(ack)).is_err() {
            warn!(pool = %self.pool_name, "router stopped, dropping deploy");
        }
    }

    /// Pending command count per worker mailbox
    #[cfg(test)]
    pub(crate) fn pending_depths(&self) -> Vec<usize> {
        self.mailboxes
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .collect()
    }

    /// Wait for the pool's tasks after shutdown has been signalled
    pub(crate) async fn join(self) {
        drop(self.requests);
        drop(self.mailboxes);
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(pool = %self.pool_name, "pool drained");
    }
}

/// Router loop: deliver each request to the least-loaded mailbox
async fn route_requests(
    pool_name: String,
    mailboxes: Vec<mpsc::Sender<DriverCommand>>,
    mut requests: mpsc::UnboundedReceiver<PoolRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            PoolRequest::Route(command) => {
                // min_by_key keeps the first minimum, so ties break to the
                // lowest worker index.
                let target = mailboxes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, tx)| tx.max_capacity() - tx.capacity())
                    .map(|(index, _)| index);

                let Some(index) = target else {
                    break;
                };
                if mailboxes[index].send(command).await.is_err() {
                    warn!(
                        pool = %pool_name,
                        worker_index = index,
                        "worker mailbox closed, dropping command"
                    );
                }
            }
            PoolRequest::Broadcast(ack) => {
                for (index, mailbox) in mailboxes.iter().enumerate() {
                    let command = DriverCommand::Deploy { ack: ack.clone() };
                    if mailbox.send(command).await.is_err() {
                        warn!(
                            pool = %pool_name,
                            worker_index = index,
                            "worker mailbox closed, dropping deploy"
                        );
                    }
                }
            }
        }
    }
    debug!(pool = %pool_name, "router stopped");
}

/// Observe one worker slot and escalate anything it could not absorb
async fn monitor_worker(
    slot: JoinHandle<Result<(), WorkerFault>>,
    pool_name: String,
    worker_id: String,
    faults: mpsc::UnboundedSender<PoolFault>,
) {
    match slot.await {
        Ok(Ok(())) => {
            debug!(pool = %pool_name, %worker_id, "worker exited cleanly");
        }
        Ok(Err(fault)) => {
            error!(
                pool = %pool_name,
                %worker_id,
                message = %fault.message,
                "worker fault escalated"
            );
            let _ = faults.send(PoolFault {
                pool_name,
                worker_id,
                message: fault.message,
            });
        }
        Err(join_error) => {
            error!(
                pool = %pool_name,
                %worker_id,
                "worker task ended abnormally: {join_error}"
            );
            let _ = faults.send(PoolFault {
                pool_name,
                worker_id,
                message: format!("worker task ended abnormally: {join_error}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploySettings;
    use crate::driver::ScriptedDriverFactory;
    use crate::transform::Transformation;
    use std::time::Duration;

    struct Harness {
        pool: Pool,
        statuses: mpsc::UnboundedReceiver<WorkerStatus>,
        faults: mpsc::UnboundedReceiver<PoolFault>,
        shutdown: watch::Sender<bool>,
    }

    fn spawn_pool(factory: ScriptedDriverFactory, concurrency: usize) -> Harness {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = TransformationTypeConfig::new(concurrency)
            .with_deploy(DeploySettings::default());

        let pool = Pool::spawn(
            "hive",
            &config,
            16,
            ShutdownMode::default(),
            Arc::new(factory),
            status_tx,
            fault_tx,
            shutdown_rx,
        );

        Harness {
            pool,
            statuses: status_rx,
            faults: fault_rx,
            shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_pool_and_worker_naming() {
        let harness = spawn_pool(ScriptedDriverFactory::new("hive"), 3);

        assert_eq!(harness.pool.type_name(), "hive");
        assert_eq!(harness.pool.pool_name(), "hive-pool");

        let ids: Vec<_> = harness
            .pool
            .tick_senders()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["hive-pool-0", "hive-pool-1", "hive-pool-2"]);

        harness.shutdown.send(true).expect("should signal");
        harness.pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_smallest_mailbox_distribution() {
        // Workers are never ticked, so every routed command stays queued
        // and the mailbox depths expose the router's choices.
        let mut harness = spawn_pool(ScriptedDriverFactory::new("hive"), 3);

        for _ in 0..3 {
            let state = harness.statuses.recv().await.expect("should boot").state;
            assert_eq!(state, crate::message::WorkerState::Booted);
        }

        for _ in 0..5 {
            let (command, _reply) = DriverCommand::transform(Transformation::new("hive"), None);
            harness.pool.route(command);
        }

        // Wait for the router task to drain its queue.
        loop {
            let depths = harness.pool.pending_depths();
            if depths.iter().sum::<usize>() == 5 {
                assert_eq!(depths, vec![2, 2, 1]);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.shutdown.send(true).expect("should signal");
        harness.pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_every_worker_once() {
        let mut harness = spawn_pool(ScriptedDriverFactory::new("hive"), 3);

        // Activate all workers.
        for _ in 0..3 {
            harness.statuses.recv().await.expect("should boot");
        }
        for (_, tick) in harness.pool.tick_senders() {
            tick.send(Tick).await.expect("should tick");
        }

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        harness.pool.broadcast(ack_tx);

        let mut acked = Vec::new();
        for _ in 0..3 {
            let ack = ack_rx.recv().await.expect("should acknowledge");
            acked.push(ack.worker_id);
        }
        acked.sort_unstable();
        assert_eq!(acked, vec!["hive-pool-0", "hive-pool-1", "hive-pool-2"]);

        // No further acknowledgements arrive.
        assert!(ack_rx.try_recv().is_err());

        harness.shutdown.send(true).expect("should signal");
        harness.pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_worker_serves_after_reactivation() {
        use crate::driver::ScriptedRun;
        use crate::message::WorkerState;

        // One shared script: first run fails retryably, the rest succeed.
        let factory = ScriptedDriverFactory::new("hive")
            .with_run(ScriptedRun::retry("backend sick"));
        let log = factory.log();
        let mut harness = spawn_pool(factory, 2);

        for _ in 0..2 {
            harness.statuses.recv().await.expect("should boot");
        }
        for (_, tick) in harness.pool.tick_senders() {
            tick.send(Tick).await.expect("should tick");
        }

        let (first, first_reply) = DriverCommand::transform(Transformation::new("hive"), None);
        harness.pool.route(first);

        // The first command dies with the restarting worker.
        assert!(first_reply.await.is_err());

        // Wait for the restarted worker to boot again, then reactivate it.
        loop {
            let status = harness.statuses.recv().await.expect("should report");
            if status.worker_id == "hive-pool-0" && status.state == WorkerState::Booted {
                break;
            }
        }
        for (id, tick) in harness.pool.tick_senders() {
            if id == "hive-pool-0" {
                tick.send(Tick).await.expect("should re-tick");
            }
        }

        let (second, second_reply) = DriverCommand::transform(Transformation::new("hive"), None);
        harness.pool.route(second);
        assert!(second_reply.await.expect("should reply").is_success());
        assert_eq!(log.creations(), 3, "two initial boots plus one restart");

        // No fault escalated: retryable failures are absorbed in the slot.
        assert!(harness.faults.try_recv().is_err());

        harness.shutdown.send(true).expect("should signal");
        harness.pool.join().await;
    }
}
