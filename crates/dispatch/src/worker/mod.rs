//! Worker event loop and per-type pools
//!
//! A worker owns one driver and one mailbox, executes one command at a
//! time, and reports every lifecycle transition to the dispatcher. Workers
//! never pull work on their own after booting: the dispatcher gates
//! activation with a one-shot tick, which is how backoff pacing reaches a
//! restarting worker.

pub(crate) mod pool;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, instrument, warn};

use crate::config::{DeploySettings, ShutdownMode};
use crate::driver::{Driver, DriverError, DriverFactory, RunState};
use crate::message::{DeployAck, DriverCommand, TransformationReply, WorkerStatus};
use crate::transform::Transformation;

/// One-shot activation signal from the dispatcher
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tick;

/// Delay before re-attempting driver creation after an initialisation fault
///
/// Backoff pacing only applies from the first successful boot onwards; this
/// fixed delay keeps a constructor that fails instantly from spinning hot.
const INIT_RESTART_DELAY: Duration = Duration::from_millis(250);

/// Unrecoverable fault escalated out of a worker slot
#[derive(Debug)]
pub(crate) struct WorkerFault {
    pub(crate) worker_id: String,
    pub(crate) message: String,
}

/// Why one incarnation of a worker ended
enum IncarnationEnd {
    /// Driver construction failed; restart after a short delay
    Init(DriverError),

    /// The driver raised a retryable failure; restart in place
    Retryable(DriverError),

    /// Unknown fault; escalate to the supervisor
    Fatal(String),
}

/// A worker slot: one driver, one mailbox, one command at a time
///
/// The slot's identity (`worker_id`) and mailbox survive restarts; only the
/// driver instance is rebuilt per incarnation.
pub(crate) struct Worker {
    id: String,
    factory: Arc<dyn DriverFactory>,
    commands: mpsc::Receiver<DriverCommand>,
    ticks: mpsc::Receiver<Tick>,
    status: mpsc::UnboundedSender<WorkerStatus>,
    deploy: DeploySettings,
    run_timeout: Option<Duration>,
    shutdown_mode: ShutdownMode,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        factory: Arc<dyn DriverFactory>,
        commands: mpsc::Receiver<DriverCommand>,
        ticks: mpsc::Receiver<Tick>,
        status: mpsc::UnboundedSender<WorkerStatus>,
        deploy: DeploySettings,
        run_timeout: Option<Duration>,
        shutdown_mode: ShutdownMode,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            factory,
            commands,
            ticks,
            status,
            deploy,
            run_timeout,
            shutdown_mode,
            shutdown,
        }
    }

    /// Run the slot until shutdown or an unrecoverable fault
    ///
    /// Retryable and initialisation faults are absorbed here by starting a
    /// fresh incarnation with the same identity and mailbox. Anything else
    /// ends the slot with a [`WorkerFault`] for the supervisor.
    #[instrument(skip(self), fields(worker_id = %self.id))]
    pub(crate) async fn run(mut self) -> Result<(), WorkerFault> {
        loop {
            match self.serve_incarnation().await {
                Ok(()) => {
                    debug!("worker stopped");
                    return Ok(());
                }
                Err(IncarnationEnd::Init(error)) => {
                    warn!(%error, "driver initialisation failed, restarting worker");
                    self.emit(WorkerStatus::failed(&self.id));
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(INIT_RESTART_DELAY) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
                Err(IncarnationEnd::Retryable(error)) => {
                    warn!(%error, "retryable driver failure, restarting worker");
                    self.emit(WorkerStatus::failed(&self.id));
                }
                Err(IncarnationEnd::Fatal(message)) => {
                    error!(%message, "unrecoverable worker fault, escalating");
                    return Err(WorkerFault {
                        worker_id: self.id.clone(),
                        message,
                    });
                }
            }
        }
    }

    /// One incarnation: boot the driver, await activation, serve commands
    ///
    /// Returns `Ok(())` only for a clean stop (shutdown or teardown).
    async fn serve_incarnation(&mut self) -> Result<(), IncarnationEnd> {
        if *self.shutdown.borrow() {
            return Ok(());
        }

        // Booting
        let driver = self
            .factory
            .create()
            .await
            .map_err(IncarnationEnd::Init)?;
        self.emit(WorkerStatus::booted(&self.id));
        debug!(driver = driver.name(), "worker booted, awaiting activation tick");

        // Do not pull work until the dispatcher says so.
        tokio::select! {
            _ = self.shutdown.changed() => return Ok(()),
            tick = self.ticks.recv() => {
                if tick.is_none() {
                    return Err(IncarnationEnd::Fatal("activation channel closed".to_string()));
                }
            }
        }

        loop {
            let command = tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    // All senders gone: the dispatcher is tearing down.
                    None => return Ok(()),
                },
            };

            match self.shutdown_mode {
                ShutdownMode::FinishInFlight => {
                    self.handle_command(driver.as_ref(), command).await?;
                }
                ShutdownMode::Drop => {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        result = self.handle_command(driver.as_ref(), command) => result?,
                        _ = shutdown.changed() => return Ok(()),
                    }
                }
            }
        }
    }

    /// Execute one command and deliver exactly one terminal reply
    async fn handle_command(
        &self,
        driver: &dyn Driver,
        command: DriverCommand,
    ) -> Result<(), IncarnationEnd> {
        match command {
            DriverCommand::Transform {
                transformation,
                view,
                reply,
            } => {
                self.emit(WorkerStatus::running(&self.id, transformation.clone()));
                debug!(%transformation, "executing transformation");

                match self.execute(driver, &transformation).await {
                    Ok(RunState::Succeeded { comment }) => {
                        let _ = reply.send(TransformationReply::Success {
                            view,
                            checksum: transformation.checksum(),
                            timestamp: Utc::now(),
                            comment,
                        });
                    }
                    Ok(RunState::Failed { error }) if error.retryable => {
                        // The reply sender drops with the command; the
                        // caller's timeout covers the lost run.
                        return Err(IncarnationEnd::Retryable(error));
                    }
                    Ok(RunState::Failed { error }) => {
                        let _ = reply.send(TransformationReply::Failure {
                            view,
                            reason: error.to_string(),
                        });
                    }
                    Ok(RunState::Ongoing) => {
                        return Err(IncarnationEnd::Fatal(
                            "driver yielded a non-terminal run state".to_string(),
                        ));
                    }
                    Err(error) if error.retryable => {
                        return Err(IncarnationEnd::Retryable(error));
                    }
                    Err(error) => {
                        let _ = reply.send(TransformationReply::Failure {
                            view,
                            reason: error.to_string(),
                        });
                    }
                }

                self.emit(WorkerStatus::idle(&self.id));
            }

            DriverCommand::Deploy { ack } => {
                debug!(location = %self.deploy.location, "deploying driver libraries");

                match driver.deploy_all(&self.deploy).await {
                    Ok(success) => {
                        let _ = ack.send(DeployAck {
                            worker_id: self.id.clone(),
                            success,
                        });
                    }
                    Err(error) if error.retryable => {
                        return Err(IncarnationEnd::Retryable(error));
                    }
                    Err(error) => {
                        warn!(%error, "library deployment failed");
                        let _ = ack.send(DeployAck {
                            worker_id: self.id.clone(),
                            success: false,
                        });
                    }
                }

                self.emit(WorkerStatus::idle(&self.id));
            }
        }

        Ok(())
    }

    /// Run a transformation, applying the per-type timeout if configured
    async fn execute(
        &self,
        driver: &dyn Driver,
        transformation: &Transformation,
    ) -> Result<RunState, DriverError> {
        match self.run_timeout {
            Some(limit) => {
                let mut handle = driver.run(transformation).await?;
                match tokio::time::timeout(limit, handle.wait()).await {
                    Ok(state) => Ok(state),
                    Err(_) => {
                        driver.kill(&handle).await;
                        Ok(RunState::Failed {
                            error: DriverError::terminal(format!(
                                "run exceeded the {}ms timeout",
                                limit.as_millis()
                            )),
                        })
                    }
                }
            }
            None => driver.run_and_wait(transformation).await,
        }
    }

    fn emit(&self, status: WorkerStatus) {
        if self.status.send(status).is_err() {
            debug!(worker_id = %self.id, "status channel closed");
        }
    }
}
