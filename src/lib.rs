//! Shoal - Kubernetes controller for clustered search services
//!
//! Shoal watches `SearchCluster` resources and keeps the objects that
//! realize them (one worker pod per declared node, a headless discovery
//! service and a public service) in line with the declared topology.
//!
//! # Architecture
//!
//! - Watch notifications for clusters and everything shoal owns are routed
//!   to the owning cluster's key and fed into one deduplicating work queue
//! - A fixed pool of workers drains the queue; the same cluster is never
//!   reconciled by two workers at once
//! - Each reconcile pass is level-triggered and idempotent: translate the
//!   spec, diff against the store, apply the difference, publish status
//!
//! # Modules
//!
//! - [`crd`] - The SearchCluster custom resource
//! - [`desired`] - Pure translation of a cluster into its desired objects
//! - [`accessor`] - Store access over the API server or in memory
//! - [`controller`] - The reconcile pass
//! - [`runtime`] - Work queue, worker pool, watch routing and manager
//! - [`labels`] - Labels, selectors and naming hashes
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff policies
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod accessor;
pub mod controller;
pub mod crd;
pub mod desired;
pub mod error;
pub mod events;
pub mod labels;
pub mod retry;
pub mod runtime;
pub mod telemetry;

#[cfg(test)]
mod fixtures;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Shared by the CLI defaults and the Default impls of the runtime configs.

/// Default number of concurrent reconciles
pub const DEFAULT_WORKERS: usize = 4;

/// Default interval between full resyncs, in seconds
pub const DEFAULT_RESYNC_SECS: u64 = 60;

/// Default requeue delay while a cluster is settling, in seconds
pub const DEFAULT_PROGRESS_SECS: u64 = 10;

/// Default time in-flight reconciles get to finish on shutdown, in seconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default maximum number of keys waiting in the work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of attempts for a conflicting write within one pass
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;
