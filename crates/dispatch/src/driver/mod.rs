//! Driver contract and registry
//!
//! A driver executes one transformation type. The dispatcher core never
//! implements concrete drivers (HiveQL runner, filesystem operations, …);
//! it consumes this contract:
//!
//! - [`Driver`] - run, poll, kill and deploy operations
//! - [`DriverFactory`] - builds one driver instance per worker incarnation
//! - [`DriverError`] - failure classification (`retryable` restarts the
//!   worker, terminal failures are replied to the caller)
//! - [`DriverRegistry`] - type name to factory lookup used at bootstrap
//! - [`ScriptedDriver`] - scriptable in-crate driver for tests

mod definition;
mod handle;
mod registry;
mod scripted;

pub use definition::{Driver, DriverError, DriverFactory, RunState};
pub use handle::{run_pair, RunHandle, RunSlot};
pub use registry::{DriverRegistry, RegistryError};
pub use scripted::{ScriptLog, ScriptLogHandle, ScriptedDriver, ScriptedDriverFactory, ScriptedRun};
