//! Run handle and completion slot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::transform::Transformation;

use super::definition::{DriverError, RunState};

/// Create a connected completion slot / run handle pair
///
/// The driver keeps the [`RunSlot`] and completes it from wherever the
/// actual work runs; the [`RunHandle`] goes back to the worker for
/// polling, waiting and cancellation.
pub fn run_pair(transformation: &Transformation) -> (RunSlot, RunHandle) {
    let (tx, rx) = watch::channel(RunState::Ongoing);
    let cancelled = Arc::new(AtomicBool::new(false));

    let slot = RunSlot {
        tx,
        cancelled: Arc::clone(&cancelled),
    };
    let handle = RunHandle {
        id: Uuid::now_v7(),
        started: Utc::now(),
        checksum: transformation.checksum(),
        state: rx,
        cancelled,
    };

    (slot, handle)
}

/// Driver-side completion publisher for one run
#[derive(Debug)]
pub struct RunSlot {
    tx: watch::Sender<RunState>,
    cancelled: Arc<AtomicBool>,
}

impl RunSlot {
    /// Publish a terminal state
    pub fn complete(&self, state: RunState) {
        self.tx.send_replace(state);
    }

    /// Publish success
    pub fn succeed(self, comment: Option<String>) {
        self.complete(RunState::Succeeded { comment });
    }

    /// Publish failure
    pub fn fail(self, error: DriverError) {
        self.complete(RunState::Failed { error });
    }

    /// Whether the handle side requested cancellation
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Opaque handle for one driver run
///
/// Returned immediately by [`Driver::run`](super::Driver::run); carries the
/// completion state and the cancellation flag.
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: Uuid,
    started: DateTime<Utc>,
    checksum: String,
    state: watch::Receiver<RunState>,
    cancelled: Arc<AtomicBool>,
}

impl RunHandle {
    /// Unique id of this run attempt
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the run was started
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Checksum of the transformation being run
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Non-blocking snapshot of the run's state
    pub fn poll(&self) -> RunState {
        self.state.borrow().clone()
    }

    /// Wait for the run's terminal state
    ///
    /// A driver that drops its [`RunSlot`] without publishing a terminal
    /// state yields a terminal failure here, so waiters never hang on an
    /// abandoned run.
    pub async fn wait(&mut self) -> RunState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                let last = self.state.borrow().clone();
                if last.is_terminal() {
                    return last;
                }
                return RunState::Failed {
                    error: DriverError::terminal("driver abandoned the run"),
                };
            }
        }
    }

    /// Request cancellation; best-effort and idempotent
    pub fn kill(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_killed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transformation() -> Transformation {
        Transformation::new("hive").with_parameter("sql", "select 1")
    }

    #[test]
    fn test_poll_starts_ongoing() {
        let (_slot, handle) = run_pair(&transformation());
        assert_eq!(handle.poll(), RunState::Ongoing);
    }

    #[tokio::test]
    async fn test_wait_observes_success() {
        let (slot, mut handle) = run_pair(&transformation());

        tokio::spawn(async move {
            slot.succeed(Some("1 row written".to_string()));
        });

        let state = handle.wait().await;
        assert_eq!(
            state,
            RunState::Succeeded {
                comment: Some("1 row written".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_wait_observes_failure() {
        let (slot, mut handle) = run_pair(&transformation());
        slot.fail(DriverError::terminal("bad query"));

        let state = handle.wait().await;
        assert!(matches!(state, RunState::Failed { error } if !error.retryable));
    }

    #[tokio::test]
    async fn test_abandoned_slot_yields_terminal_failure() {
        let (slot, mut handle) = run_pair(&transformation());
        drop(slot);

        let state = handle.wait().await;
        assert!(matches!(state, RunState::Failed { .. }));
    }

    #[test]
    fn test_kill_is_idempotent() {
        let (slot, handle) = run_pair(&transformation());

        assert!(!slot.is_cancelled());
        handle.kill();
        handle.kill();
        assert!(slot.is_cancelled());
        assert!(handle.is_killed());
    }

    #[test]
    fn test_handle_carries_checksum() {
        let t = transformation();
        let (_slot, handle) = run_pair(&t);
        assert_eq!(handle.checksum(), t.checksum());
    }
}
