//! Data models for the database test harness.
//!
//! This module re-exports all model types used throughout the crate.

pub mod backend;
pub mod query;

// Re-export commonly used types
pub use backend::{BackendCapabilities, BackendDescriptor, BackendKind, ConnectionPoolConfig};
pub use query::{ForeignKey, QueryParam, Record};
