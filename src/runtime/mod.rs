//! Controller runtime: watch routing, work queue, worker pool and manager
//!
//! Store changes flow through the [`WatchRouter`] into a single
//! deduplicating [`WorkQueue`]; a fixed [`WorkerPool`] drains it and hands
//! each key to a [`Reconcile`] implementation. The [`Manager`] owns all of
//! it and shuts it down gracefully.

mod manager;
mod pool;
mod queue;
mod router;

pub use manager::{Manager, ManagerConfig};
pub use pool::{Reconcile, ReconcileRecord, WorkerPool};
pub use queue::{AddOutcome, WorkQueue};
pub use router::{
    kube_notifications, periodic_resync, Notification, WatchRouter, WATCH_TIMEOUT_SECS,
};
