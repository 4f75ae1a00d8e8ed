//! Scripted driver for tests
//!
//! An in-crate driver whose behavior is programmed as a queue of
//! [`ScriptedRun`] steps, in the same spirit as the in-memory stores other
//! execution engines ship for testing. Every worker incarnation created
//! from one [`ScriptedDriverFactory`] consumes steps from the same shared
//! script and records what it observed in a [`ScriptLog`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DeploySettings;
use crate::transform::Transformation;

use super::definition::{Driver, DriverError, DriverFactory, RunState};
use super::handle::{run_pair, RunHandle};

/// One scripted run outcome
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Complete successfully
    Succeed {
        /// Comment carried in the terminal state
        comment: Option<String>,
    },

    /// Fail terminally (the worker stays alive)
    FailTerminal {
        /// Failure reason
        reason: String,
    },

    /// Raise a retryable failure (the worker restarts)
    FailRetryable {
        /// Failure reason
        reason: String,
    },

    /// Never complete until killed
    Hang,

    /// Panic inside the driver (an unknown fault; escalates)
    Panic,
}

impl ScriptedRun {
    /// A plain success step
    pub fn succeed() -> Self {
        Self::Succeed { comment: None }
    }

    /// A success step with a comment
    pub fn succeed_with(comment: impl Into<String>) -> Self {
        Self::Succeed {
            comment: Some(comment.into()),
        }
    }

    /// A terminal failure step
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::FailTerminal {
            reason: reason.into(),
        }
    }

    /// A retryable failure step
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::FailRetryable {
            reason: reason.into(),
        }
    }
}

/// Record of everything the scripted drivers observed
#[derive(Debug, Default)]
pub struct ScriptLog {
    creations: AtomicUsize,
    runs: Mutex<Vec<(Instant, Transformation)>>,
    deploys: Mutex<Vec<DeploySettings>>,
}

impl ScriptLog {
    /// Number of driver instances created (one per worker incarnation)
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Transformations handed to `run`, in observation order
    pub fn runs(&self) -> Vec<Transformation> {
        self.runs.lock().iter().map(|(_, t)| t.clone()).collect()
    }

    /// Instants at which `run` was invoked, in observation order
    pub fn run_instants(&self) -> Vec<Instant> {
        self.runs.lock().iter().map(|(at, _)| *at).collect()
    }

    /// Number of observed runs
    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    /// Deploy settings handed to `deploy_all`, in observation order
    pub fn deploys(&self) -> Vec<DeploySettings> {
        self.deploys.lock().clone()
    }

    /// Number of observed deploys
    pub fn deploy_count(&self) -> usize {
        self.deploys.lock().len()
    }
}

/// Shared state behind a scripted factory and its drivers
#[derive(Debug)]
struct ScriptState {
    script: Mutex<VecDeque<ScriptedRun>>,
    init_failures: AtomicUsize,
    fail_deploys: AtomicBool,
    log: ScriptLog,
}

/// Factory producing [`ScriptedDriver`]s
///
/// # Example
///
/// ```
/// use viewflow_dispatch::{ScriptedDriverFactory, ScriptedRun};
///
/// let factory = ScriptedDriverFactory::new("hive")
///     .with_run(ScriptedRun::retry("metastore flapping"))
///     .with_run(ScriptedRun::succeed());
/// let log = factory.log();
/// ```
#[derive(Debug)]
pub struct ScriptedDriverFactory {
    transformation_type: String,
    state: Arc<ScriptState>,
}

impl ScriptedDriverFactory {
    /// Create a factory for the given transformation type
    ///
    /// With an empty script every run succeeds.
    pub fn new(transformation_type: impl Into<String>) -> Self {
        Self {
            transformation_type: transformation_type.into(),
            state: Arc::new(ScriptState {
                script: Mutex::new(VecDeque::new()),
                init_failures: AtomicUsize::new(0),
                fail_deploys: AtomicBool::new(false),
                log: ScriptLog::default(),
            }),
        }
    }

    /// Append a scripted run step
    pub fn with_run(self, run: ScriptedRun) -> Self {
        self.state.script.lock().push_back(run);
        self
    }

    /// Fail the next `count` driver creations (initialisation faults)
    pub fn with_init_failures(self, count: usize) -> Self {
        self.state.init_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Make every deploy report failure
    pub fn with_failing_deploys(self) -> Self {
        self.state.fail_deploys.store(true, Ordering::SeqCst);
        self
    }

    /// Handle onto the shared observation log
    ///
    /// The log outlives the factory once it is moved into a registry.
    pub fn log(&self) -> Arc<ScriptLogHandle> {
        Arc::new(ScriptLogHandle {
            state: Arc::clone(&self.state),
        })
    }
}

/// Cheap handle onto a factory's [`ScriptLog`]
#[derive(Debug)]
pub struct ScriptLogHandle {
    state: Arc<ScriptState>,
}

impl std::ops::Deref for ScriptLogHandle {
    type Target = ScriptLog;

    fn deref(&self) -> &Self::Target {
        &self.state.log
    }
}

#[async_trait]
impl DriverFactory for ScriptedDriverFactory {
    fn transformation_type(&self) -> &str {
        &self.transformation_type
    }

    async fn create(&self) -> Result<Box<dyn Driver>, DriverError> {
        let init_failure = self
            .state
            .init_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if init_failure {
            return Err(DriverError::retryable("scripted initialisation failure"));
        }

        self.state.log.creations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDriver {
            transformation_type: self.transformation_type.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Driver whose behavior follows the factory's script
#[derive(Debug)]
pub struct ScriptedDriver {
    transformation_type: String,
    state: Arc<ScriptState>,
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        &self.transformation_type
    }

    async fn run(&self, transformation: &Transformation) -> Result<RunHandle, DriverError> {
        self.state
            .log
            .runs
            .lock()
            .push((Instant::now(), transformation.clone()));

        let step = self
            .state
            .script
            .lock()
            .pop_front()
            .unwrap_or(ScriptedRun::Succeed { comment: None });

        let (slot, handle) = run_pair(transformation);
        match step {
            ScriptedRun::Succeed { comment } => slot.succeed(comment),
            ScriptedRun::FailTerminal { reason } => slot.fail(DriverError::terminal(reason)),
            ScriptedRun::FailRetryable { reason } => {
                return Err(DriverError::retryable(reason));
            }
            ScriptedRun::Hang => {
                // Complete only on cancellation, so kill() is observable.
                tokio::spawn(async move {
                    loop {
                        if slot.is_cancelled() {
                            slot.fail(DriverError::terminal("run killed"));
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
            }
            ScriptedRun::Panic => panic!("scripted driver panic"),
        }

        Ok(handle)
    }

    async fn deploy_all(&self, settings: &DeploySettings) -> Result<bool, DriverError> {
        self.state.log.deploys.lock().push(settings.clone());
        Ok(!self.state.fail_deploys.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformation() -> Transformation {
        Transformation::new("hive").with_parameter("sql", "select 1")
    }

    #[tokio::test]
    async fn test_empty_script_succeeds() {
        let factory = ScriptedDriverFactory::new("hive");
        let driver = factory.create().await.expect("should create");

        let state = driver
            .run_and_wait(&transformation())
            .await
            .expect("should run");
        assert!(matches!(state, RunState::Succeeded { .. }));
    }

    #[tokio::test]
    async fn test_script_steps_consumed_in_order() {
        let factory = ScriptedDriverFactory::new("hive")
            .with_run(ScriptedRun::fail("bad query"))
            .with_run(ScriptedRun::succeed_with("done"));
        let driver = factory.create().await.expect("should create");

        let first = driver
            .run_and_wait(&transformation())
            .await
            .expect("should run");
        assert!(matches!(first, RunState::Failed { error } if !error.retryable));

        let second = driver
            .run_and_wait(&transformation())
            .await
            .expect("should run");
        assert_eq!(
            second,
            RunState::Succeeded {
                comment: Some("done".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_retryable_step_raises() {
        let factory =
            ScriptedDriverFactory::new("hive").with_run(ScriptedRun::retry("env down"));
        let driver = factory.create().await.expect("should create");

        let result = driver.run_and_wait(&transformation()).await;
        assert!(matches!(result, Err(error) if error.retryable));
    }

    #[tokio::test]
    async fn test_init_failures_consumed_before_creation() {
        let factory = ScriptedDriverFactory::new("hive").with_init_failures(2);
        let log = factory.log();

        assert!(factory.create().await.is_err());
        assert!(factory.create().await.is_err());
        assert!(factory.create().await.is_ok());
        assert_eq!(log.creations(), 1);
    }

    #[tokio::test]
    async fn test_log_records_runs_and_deploys() {
        let factory = ScriptedDriverFactory::new("hive");
        let log = factory.log();
        let driver = factory.create().await.expect("should create");

        let t = transformation();
        driver.run_and_wait(&t).await.expect("should run");
        driver
            .deploy_all(&DeploySettings::default())
            .await
            .expect("should deploy");

        assert_eq!(log.runs(), vec![t]);
        assert_eq!(log.deploy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_completes_on_kill() {
        let factory = ScriptedDriverFactory::new("hive").with_run(ScriptedRun::Hang);
        let driver = factory.create().await.expect("should create");

        let mut handle = driver.run(&transformation()).await.expect("should start");
        assert_eq!(handle.poll(), RunState::Ongoing);

        driver.kill(&handle).await;
        let state = handle.wait().await;
        assert!(matches!(state, RunState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_failing_deploys() {
        let factory = ScriptedDriverFactory::new("hive").with_failing_deploys();
        let driver = factory.create().await.expect("should create");

        let staged = driver
            .deploy_all(&DeploySettings::default())
            .await
            .expect("should deploy");
        assert!(!staged);
    }
}
