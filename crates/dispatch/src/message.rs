//! Command, reply and status message types
//!
//! Every inbound shape is a variant of a sum type with exhaustive matching
//! at the receiver; every command carries its own reply handle, so no
//! ambient "current sender" context exists anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::transform::{Transformation, View};

/// A command routed to exactly one worker (or broadcast, for deploys)
///
/// The reply handle is part of the command: the receiving worker delivers
/// exactly one terminal message to it.
#[derive(Debug)]
pub enum DriverCommand {
    /// Execute a transformation, optionally bound to a view
    Transform {
        /// The recipe to execute
        transformation: Transformation,

        /// The view being materialised, echoed back in the reply
        view: Option<View>,

        /// Terminal reply channel
        reply: oneshot::Sender<TransformationReply>,
    },

    /// Stage the driver's configured libraries
    Deploy {
        /// Per-worker acknowledgement channel
        ack: mpsc::UnboundedSender<DeployAck>,
    },
}

impl DriverCommand {
    /// Build a transform command, returning the reply receiver
    pub fn transform(
        transformation: Transformation,
        view: Option<View>,
    ) -> (Self, oneshot::Receiver<TransformationReply>) {
        let (reply, rx) = oneshot::channel();
        (
            Self::Transform {
                transformation,
                view,
                reply,
            },
            rx,
        )
    }

    /// Build a deploy command, returning the acknowledgement receiver
    pub fn deploy() -> (Self, mpsc::UnboundedReceiver<DeployAck>) {
        let (ack, rx) = mpsc::unbounded_channel();
        (Self::Deploy { ack }, rx)
    }

    /// The transformation type this command routes by, if any
    pub fn transformation_type(&self) -> Option<&str> {
        match self {
            Self::Transform { transformation, .. } => Some(transformation.transformation_type()),
            Self::Deploy { .. } => None,
        }
    }
}

/// Terminal reply for one transformation command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransformationReply {
    /// The transformation succeeded
    Success {
        /// The view that was materialised, if the command was view-bound
        view: Option<View>,

        /// Checksum of the executed transformation
        checksum: String,

        /// When the terminal state was observed
        timestamp: DateTime<Utc>,

        /// Free-form driver comment
        comment: Option<String>,
    },

    /// The transformation failed terminally
    Failure {
        /// The view that was being materialised, if any
        view: Option<View>,

        /// Failure reason
        reason: String,
    },
}

impl TransformationReply {
    /// Whether this reply is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Per-worker acknowledgement of a broadcast deploy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployAck {
    /// The acknowledging worker
    pub worker_id: String,

    /// Whether every staging step succeeded
    pub success: bool,
}

/// Lifecycle state reported by a worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Driver initialised; awaiting an activation tick
    Booted,

    /// Ready for the next command
    Idle,

    /// Executing a transformation
    Running,

    /// The last incarnation ended in a fault; a restart follows
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Booted => write!(f, "booted"),
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status event emitted by a worker towards the dispatcher
///
/// `worker_id` is stable for the worker's lifetime and survives restarts;
/// it is the worker's position in its pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatus {
    /// Stable worker identity, `"{type_name}-pool-{index}"`
    pub worker_id: String,

    /// Reported lifecycle state
    pub state: WorkerState,

    /// The transformation currently being executed, if running
    pub current: Option<Transformation>,

    /// When the state was entered
    pub timestamp: DateTime<Utc>,
}

impl WorkerStatus {
    fn new(worker_id: &str, state: WorkerState, current: Option<Transformation>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            state,
            current,
            timestamp: Utc::now(),
        }
    }

    /// A booted status
    pub fn booted(worker_id: &str) -> Self {
        Self::new(worker_id, WorkerState::Booted, None)
    }

    /// An idle status
    pub fn idle(worker_id: &str) -> Self {
        Self::new(worker_id, WorkerState::Idle, None)
    }

    /// A running status carrying the in-flight transformation
    pub fn running(worker_id: &str, transformation: Transformation) -> Self {
        Self::new(worker_id, WorkerState::Running, Some(transformation))
    }

    /// A failed status
    pub fn failed(worker_id: &str) -> Self {
        Self::new(worker_id, WorkerState::Failed, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_command_routes_by_type() {
        let (cmd, _rx) = DriverCommand::transform(Transformation::new("hive"), None);
        assert_eq!(cmd.transformation_type(), Some("hive"));
    }

    #[test]
    fn test_deploy_command_has_no_routing_type() {
        let (cmd, _rx) = DriverCommand::deploy();
        assert_eq!(cmd.transformation_type(), None);
    }

    #[tokio::test]
    async fn test_reply_channel_delivers() {
        let (cmd, rx) = DriverCommand::transform(Transformation::new("hive"), None);

        if let DriverCommand::Transform { reply, .. } = cmd {
            reply
                .send(TransformationReply::Failure {
                    view: None,
                    reason: "nope".to_string(),
                })
                .expect("should send");
        }

        let reply = rx.await.expect("should receive");
        assert!(!reply.is_success());
    }

    #[test]
    fn test_worker_state_display() {
        assert_eq!(WorkerState::Booted.to_string(), "booted");
        assert_eq!(WorkerState::Idle.to_string(), "idle");
        assert_eq!(WorkerState::Running.to_string(), "running");
        assert_eq!(WorkerState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_status_constructors() {
        let t = Transformation::new("hive");
        let running = WorkerStatus::running("hive-pool-0", t.clone());

        assert_eq!(running.worker_id, "hive-pool-0");
        assert_eq!(running.state, WorkerState::Running);
        assert_eq!(running.current, Some(t));

        let idle = WorkerStatus::idle("hive-pool-0");
        assert_eq!(idle.state, WorkerState::Idle);
        assert!(idle.current.is_none());
    }

    #[test]
    fn test_status_serialization() {
        let status = WorkerStatus::booted("filesystem-pool-2");
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains("\"booted\""));
        assert!(json.contains("filesystem-pool-2"));
    }
}
