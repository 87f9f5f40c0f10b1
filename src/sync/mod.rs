//! Outbox replay: applies queued writes to the remote service in order.
//!
//! - `remote`: the remote service contract and its HTTP implementation
//! - `coordinator`: single-flight, stop-on-first-failure drain of the queue
//! - `auto`: connectivity-driven triggering and retry backoff

mod auto;
mod coordinator;
#[cfg(test)]
pub(crate) mod mock;
mod remote;

pub use auto::{spawn_auto_sync, RetryPolicy};
pub use coordinator::{SyncCoordinator, SyncOutcome, SyncReport, SyncStatus};
pub use remote::{HttpRemote, RemoteService};
