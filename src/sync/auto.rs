//! Background driver that turns connectivity edges into sync requests.

use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use super::coordinator::{SyncCoordinator, SyncOutcome};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};

/// When to try again after a drain halts.
///
/// Retries only happen while online. The delay doubles per consecutive failed
/// drain up to `max_delay`, and resets after a completed drain or going offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub enabled: bool,
  pub initial_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      enabled: true,
      initial_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(300),
    }
  }
}

impl RetryPolicy {
  /// Only drain on connectivity edges and manual requests.
  pub fn manual() -> Self {
    Self {
      enabled: false,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    self
      .initial_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// Spawn the auto-sync loop.
///
/// Drains once at startup when online, on every offline->online edge, and
/// on the retry schedule after a halted drain. Drains started elsewhere
/// (manual requests, writes queued while online) are watched too, so their
/// failures are retried the same way.
pub fn spawn_auto_sync(
  coordinator: SyncCoordinator,
  monitor: ConnectivityMonitor,
  policy: RetryPolicy,
) -> JoinHandle<()> {
  // Subscribe before spawning so an edge right after this call is not missed
  let mut transitions = Box::pin(monitor.transitions());
  let mut status = coordinator.subscribe();

  tokio::spawn(async move {
    let mut attempt: u32 = 0;
    let mut retry_at = if monitor.is_online() {
      run_sync(&coordinator, &policy, &mut attempt).await
    } else {
      None
    };

    loop {
      let deadline = retry_at;
      tokio::select! {
        event = transitions.next() => match event {
          Some(ConnectivityEvent::Online) => {
            retry_at = run_sync(&coordinator, &policy, &mut attempt).await;
          }
          Some(ConnectivityEvent::Offline) => {
            attempt = 0;
            retry_at = None;
          }
          None => break,
        },
        changed = status.changed() => {
          if changed.is_err() {
            break;
          }
          let current = status.borrow_and_update().clone();
          if !current.is_syncing {
            if current.last_error.is_none() {
              attempt = 0;
            } else if retry_at.is_none() && current.pending_count > 0 && monitor.is_online() {
              retry_at = schedule_retry(&policy, &mut attempt);
            }
          }
        }
        _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          retry_at = if monitor.is_online() {
            run_sync(&coordinator, &policy, &mut attempt).await
          } else {
            None
          };
        }
      }
    }
  })
}

/// Request a drain and return when to retry, if at all.
async fn run_sync(
  coordinator: &SyncCoordinator,
  policy: &RetryPolicy,
  attempt: &mut u32,
) -> Option<Instant> {
  match coordinator.request_sync().await {
    Ok(report) => match report.outcome {
      SyncOutcome::Completed => {
        *attempt = 0;
        None
      }
      // Picked up from the status channel once the running drain ends
      SyncOutcome::AlreadyRunning => None,
      SyncOutcome::Halted { .. } => schedule_retry(policy, attempt),
    },
    Err(e) => {
      warn!(error = %e, "Automatic sync failed");
      schedule_retry(policy, attempt)
    }
  }
}

fn schedule_retry(policy: &RetryPolicy, attempt: &mut u32) -> Option<Instant> {
  if !policy.enabled {
    return None;
  }
  let delay = policy.delay_for(*attempt);
  *attempt = attempt.saturating_add(1);
  info!(delay_ms = delay.as_millis() as u64, attempt = *attempt, "Retrying sync later");
  Some(Instant::now() + delay)
}
