//! Driver trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeploySettings;
use crate::transform::Transformation;

use super::RunHandle;

/// Error type for driver failures
///
/// Classification is the heart of the supervision contract: a retryable
/// error means the driver's execution environment is transiently unhealthy
/// and the owning worker must be restarted. Everything else is a terminal
/// result for the one transformation and leaves the worker alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverError {
    /// Error message
    pub message: String,

    /// Whether the worker should be restarted
    pub retryable: bool,

    /// Underlying cause, if any
    pub cause: Option<String>,
}

impl DriverError {
    /// Create a retryable error (the worker restarts)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            cause: None,
        }
    }

    /// Create a terminal error (the worker stays alive)
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            cause: None,
        }
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} (caused by: {})", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Observable state of one driver run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// The run has not reached a terminal state yet
    Ongoing,

    /// The run finished successfully
    Succeeded {
        /// Free-form driver comment (e.g. job counters)
        comment: Option<String>,
    },

    /// The run finished unsuccessfully
    Failed {
        /// Failure details, including the retryable classification
        error: DriverError,
    },
}

impl RunState {
    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Ongoing)
    }
}

/// A driver executes transformations of one type
///
/// # Example
///
/// ```ignore
/// use viewflow_dispatch::{run_pair, Driver, DriverError, RunHandle, RunState};
///
/// struct TouchDriver;
///
/// #[async_trait]
/// impl Driver for TouchDriver {
///     fn name(&self) -> &str {
///         "filesystem"
///     }
///
///     async fn run(&self, t: &Transformation) -> Result<RunHandle, DriverError> {
///         let (slot, handle) = run_pair(t);
///         // ... spawn the actual work, completing `slot` when done ...
///         Ok(handle)
///     }
///
///     async fn deploy_all(&self, settings: &DeploySettings) -> Result<bool, DriverError> {
///         Ok(true)
///     }
/// }
/// ```
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable type name used for routing
    ///
    /// Declared explicitly by every driver; never derived from the
    /// implementing type's name.
    fn name(&self) -> &str;

    /// Begin executing a transformation
    ///
    /// Returns immediately with a handle carrying the completion state.
    ///
    /// # Errors
    ///
    /// A [`DriverError`] with `retryable == true` restarts the owning
    /// worker; a terminal error is replied to the caller as a failure.
    async fn run(&self, transformation: &Transformation) -> Result<RunHandle, DriverError>;

    /// Non-blocking snapshot of a run's state
    fn poll(&self, handle: &RunHandle) -> RunState {
        handle.poll()
    }

    /// Run a transformation and wait for its terminal state
    ///
    /// Convenience over [`run`](Driver::run) plus [`RunHandle::wait`]. Any
    /// deadline is imposed by the caller (the worker applies the per-type
    /// run timeout).
    async fn run_and_wait(
        &self,
        transformation: &Transformation,
    ) -> Result<RunState, DriverError> {
        let mut handle = self.run(transformation).await?;
        Ok(handle.wait().await)
    }

    /// Best-effort cancellation of a run; idempotent
    async fn kill(&self, handle: &RunHandle) {
        handle.kill();
    }

    /// Stage all configured libraries into the driver's working area
    ///
    /// Returns whether every staging step succeeded.
    async fn deploy_all(&self, settings: &DeploySettings) -> Result<bool, DriverError>;
}

/// Builds one driver instance per worker incarnation
///
/// Creation failures are initialisation faults: the worker restarts under
/// the same policy as a retryable run failure, regardless of the error's
/// `retryable` flag.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// The transformation type the produced drivers serve
    fn transformation_type(&self) -> &str;

    /// Create a fresh driver instance
    async fn create(&self) -> Result<Box<dyn Driver>, DriverError>;
}
