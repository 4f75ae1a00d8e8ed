//! Reliability patterns for driver supervision
//!
//! This module provides:
//! - [`Backoff`] - Truncated-binary exponential backoff with automatic reset

mod backoff;

pub use backoff::{Backoff, BackoffState, DEFAULT_RETRY_CEILING};
