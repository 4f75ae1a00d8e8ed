//! # Transformation Dispatch
//!
//! The transformation dispatcher and driver-pool supervisor of the
//! viewflow view scheduler. Views declare a transformation; requests to
//! (re)materialise a view are routed to a pool of identically-typed worker
//! drivers, load-balanced, supervised, and paced through exponential
//! backoff after failures.
//!
//! ## Features
//!
//! - **Typed worker pools**: one fixed-size pool per transformation type,
//!   with smallest-mailbox load balancing
//! - **One-for-one supervision**: retryable driver faults restart the
//!   failing worker in place; unknown faults escalate and are never
//!   swallowed
//! - **Backoff-paced reactivation**: a restarted worker is only handed
//!   work again after a truncated-binary exponential wait that resets at a
//!   configurable ceiling
//! - **Observable status**: the dispatcher tracks every worker's latest
//!   state and serves snapshots, restart storms included
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (routes commands, records status, paces activation ticks)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Pool (per type)                          │
//! │  (smallest-mailbox router, one-for-one worker supervision)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (one driver, one mailbox, one command at a time)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Status flows the other way: workers emit every state transition to the
//! dispatcher, and a `booted` status after a restart advances the worker's
//! backoff before its next activation tick is scheduled.
//!
//! ## Example
//!
//! ```
//! use viewflow_dispatch::{
//!     Dispatcher, DispatcherConfig, DriverRegistry, ScriptedDriverFactory,
//!     Transformation, TransformationTypeConfig,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut registry = DriverRegistry::new();
//! registry.register(ScriptedDriverFactory::new("hive"));
//!
//! let config = DispatcherConfig::new()
//!     .with_transformation("hive", TransformationTypeConfig::new(2));
//!
//! let handle = Dispatcher::new(config, &registry)
//!     .expect("valid configuration")
//!     .start();
//!
//! let reply = handle
//!     .transform(Transformation::new("hive").with_parameter("sql", "select 1"))
//!     .await
//!     .expect("should reply");
//! assert!(reply.is_success());
//!
//! handle.shutdown().await.expect("clean shutdown");
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod message;
pub mod reliability;
pub mod transform;

mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{
        DeploySettings, DispatcherConfig, ShutdownMode, TransformationTypeConfig,
    };
    pub use crate::dispatcher::{DispatchError, Dispatcher, DispatcherHandle};
    pub use crate::driver::{
        Driver, DriverError, DriverFactory, DriverRegistry, RunHandle, RunState,
    };
    pub use crate::message::{
        DeployAck, DriverCommand, TransformationReply, WorkerState, WorkerStatus,
    };
    pub use crate::reliability::{Backoff, BackoffState};
    pub use crate::transform::{
        FilesystemOperation, FilesystemTransformation, Transformation, View,
    };
}

// Re-export key types at crate root
pub use config::{
    ConfigError, DeploySettings, DispatcherConfig, ShutdownMode, TransformationTypeConfig,
};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherHandle};
pub use driver::{
    run_pair, Driver, DriverError, DriverFactory, DriverRegistry, RegistryError, RunHandle,
    RunSlot, RunState, ScriptedDriver, ScriptedDriverFactory, ScriptedRun,
};
pub use message::{DeployAck, DriverCommand, TransformationReply, WorkerState, WorkerStatus};
pub use reliability::{Backoff, BackoffState, DEFAULT_RETRY_CEILING};
pub use transform::{
    FilesystemOperation, FilesystemTransformation, Transformation, View, FILESYSTEM_TYPE,
};
