//! Dispatcher handle and request types

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::message::{DeployAck, DriverCommand, TransformationReply, WorkerStatus};
use crate::transform::{FilesystemTransformation, Transformation, View};

/// Errors surfaced by the dispatcher
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher loop is no longer running
    #[error("dispatcher is not running")]
    Closed,

    /// A pool escalated an unrecoverable worker fault
    #[error("pool {pool} escalated a fault from {worker_id}: {message}")]
    PoolFault {
        /// Name of the escalating pool
        pool: String,

        /// The worker whose slot ended
        worker_id: String,

        /// Fault description
        message: String,
    },

    /// The dispatcher task itself ended abnormally
    #[error("dispatcher task terminated abnormally: {0}")]
    Terminated(String),
}

/// Inbound messages processed by the dispatcher loop
///
/// Matching is exhaustive at the receiver: adding a variant is a compile
/// error until the loop handles it.
#[derive(Debug)]
pub(crate) enum DispatchRequest {
    /// A fully formed driver command
    Submit(DriverCommand),

    /// A bare transformation; the dispatcher wraps it with the reply handle
    Transform {
        transformation: Transformation,
        reply: oneshot::Sender<TransformationReply>,
    },

    /// A bare view; the dispatcher derives and binds its transformation
    Materialize {
        view: View,
        reply: oneshot::Sender<TransformationReply>,
    },

    /// A bare filesystem transformation, routed to the filesystem pool
    Filesystem {
        transformation: FilesystemTransformation,
        reply: oneshot::Sender<TransformationReply>,
    },

    /// Broadcast a deploy to every worker of every pool
    Deploy {
        ack: mpsc::UnboundedSender<DeployAck>,
    },

    /// Snapshot of the latest observed worker statuses
    GetTransformations {
        reply: oneshot::Sender<Vec<WorkerStatus>>,
    },

    /// Stop the dispatcher and drain its pools
    Shutdown,
}

/// Handle onto a running dispatcher
///
/// All submission methods are non-blocking; replies arrive on the returned
/// channels. Dropping the handle without calling
/// [`shutdown`](DispatcherHandle::shutdown) also stops the dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    pub(crate) requests: mpsc::UnboundedSender<DispatchRequest>,
    pub(crate) task: JoinHandle<Result<(), DispatchError>>,
}

impl DispatcherHandle {
    /// Submit a bare transformation
    ///
    /// The receiver yields the terminal reply; a closed receiver means the
    /// serving worker was restarted before replying (or the dispatcher
    /// stopped) and the caller should treat the run as lost.
    pub fn transform(
        &self,
        transformation: Transformation,
    ) -> oneshot::Receiver<TransformationReply> {
        let (reply, rx) = oneshot::channel();
        let _ = self.requests.send(DispatchRequest::Transform {
            transformation,
            reply,
        });
        rx
    }

    /// Request materialisation of a view
    pub fn materialize(&self, view: View) -> oneshot::Receiver<TransformationReply> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .requests
            .send(DispatchRequest::Materialize { view, reply });
        rx
    }

    /// Submit a bare filesystem transformation
    pub fn filesystem(
        &self,
        transformation: FilesystemTransformation,
    ) -> oneshot::Receiver<TransformationReply> {
        let (reply, rx) = oneshot::channel();
        let _ = self.requests.send(DispatchRequest::Filesystem {
            transformation,
            reply,
        });
        rx
    }

    /// Submit a fully formed driver command
    pub fn submit(&self, command: DriverCommand) -> Result<(), DispatchError> {
        self.requests
            .send(DispatchRequest::Submit(command))
            .map_err(|_| DispatchError::Closed)
    }

    /// Broadcast a deploy to every worker of every pool
    ///
    /// The receiver yields one acknowledgement per worker; completion of
    /// the whole deployment is for the caller to judge.
    pub fn deploy(&self) -> mpsc::UnboundedReceiver<DeployAck> {
        let (ack, rx) = mpsc::unbounded_channel();
        let _ = self.requests.send(DispatchRequest::Deploy { ack });
        rx
    }

    /// Snapshot of the latest observed status of every worker
    pub async fn transformations(&self) -> Result<Vec<WorkerStatus>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DispatchRequest::GetTransformations { reply })
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Stop the dispatcher, drain the pools and wait for it to finish
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        let _ = self.requests.send(DispatchRequest::Shutdown);
        self.join().await
    }

    /// Wait for the dispatcher to finish without requesting shutdown
    ///
    /// Surfaces the escalated fault if the dispatcher died on one.
    pub async fn join(self) -> Result<(), DispatchError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_error) => Err(DispatchError::Terminated(join_error.to_string())),
        }
    }
}
