//! Ordered replay of the pending operation queue.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::remote::RemoteService;
use crate::error::{StoreError, WriteError};
use crate::queue::{OperationKind, OperationQueue};

/// What observers (status bars, "N pending changes" badges) see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStatus {
  pub is_syncing: bool,
  pub pending_count: usize,
  /// Reason the most recent drain stopped early, cleared by a completed drain
  pub last_error: Option<String>,
  pub last_synced_at: Option<DateTime<Utc>>,
}

/// How a sync request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// The queue was drained to empty.
  Completed,
  /// `operation_id` failed to apply; it and everything after it stay queued.
  Halted { operation_id: String, reason: String },
  /// Another drain was already running; this request did nothing.
  AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub outcome: SyncOutcome,
  /// Operations applied and removed during this drain
  pub applied: usize,
  /// Operations left in the queue afterwards
  pub pending_count: usize,
}

impl SyncReport {
  pub fn is_halted(&self) -> bool {
    matches!(self.outcome, SyncOutcome::Halted { .. })
  }
}

struct Inner {
  queue: OperationQueue,
  remote: Arc<dyn RemoteService>,
  running: AtomicBool,
  status: watch::Sender<SyncStatus>,
}

/// Clears the running flag however the drain ends.
struct RunningGuard<'a> {
  inner: &'a Inner,
}

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self
      .inner
      .status
      .send_if_modified(|s| std::mem::replace(&mut s.is_syncing, false));
    self.inner.running.store(false, Ordering::Release);
  }
}

/// Drains the queue against the remote service, one operation at a time.
///
/// At most one drain runs at once; requests made while one is in flight are
/// coalesced into `SyncOutcome::AlreadyRunning`. A drain stops at the first
/// failure so later operations never overtake an earlier one.
#[derive(Clone)]
pub struct SyncCoordinator {
  inner: Arc<Inner>,
}

impl SyncCoordinator {
  pub fn new(queue: OperationQueue, remote: Arc<dyn RemoteService>) -> Self {
    let (status, _) = watch::channel(SyncStatus::default());
    let coordinator = Self {
      inner: Arc::new(Inner {
        queue,
        remote,
        running: AtomicBool::new(false),
        status,
      }),
    };

    if let Err(e) = coordinator.refresh_pending_count() {
      warn!(error = %e, "Could not read pending operation count");
    }
    coordinator
  }

  pub fn status(&self) -> SyncStatus {
    self.inner.status.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.inner.status.subscribe()
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.status.borrow().is_syncing
  }

  pub fn pending_count(&self) -> usize {
    self.inner.status.borrow().pending_count
  }

  /// Re-read the queue length into the published status.
  pub fn refresh_pending_count(&self) -> Result<usize, StoreError> {
    let count = self.inner.queue.pending_count()?;
    self.inner.status.send_if_modified(|s| {
      if s.pending_count == count {
        return false;
      }
      s.pending_count = count;
      true
    });
    Ok(count)
  }

  fn try_begin(&self) -> Option<RunningGuard<'_>> {
    self
      .inner
      .running
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| RunningGuard { inner: &self.inner })
  }

  /// Apply one write straight to the remote when nothing is queued and no
  /// drain is running.
  ///
  /// Holds the drain slot for the duration of the call, so a drain cannot
  /// replay a later write ahead of this one. Returns `false` when the write
  /// has to be queued instead.
  pub async fn apply_if_idle(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: &Value,
  ) -> Result<bool, WriteError> {
    let Some(_guard) = self.try_begin() else {
      return Ok(false);
    };
    if self.inner.queue.pending_count()? > 0 {
      return Ok(false);
    }

    self.inner.remote.apply(resource, kind, payload).await?;
    Ok(true)
  }

  /// Drain the queue now, unless a drain is already running.
  pub async fn request_sync(&self) -> Result<SyncReport, StoreError> {
    let Some(_guard) = self.try_begin() else {
      debug!("Sync already in progress, request coalesced");
      return Ok(SyncReport {
        outcome: SyncOutcome::AlreadyRunning,
        applied: 0,
        pending_count: self.pending_count(),
      });
    };

    self.inner.status.send_modify(|s| s.is_syncing = true);

    let result = self.drain().await;

    match &result {
      Ok(report) => self.inner.status.send_modify(|s| {
        s.pending_count = report.pending_count;
        match &report.outcome {
          SyncOutcome::Completed => {
            s.last_error = None;
            s.last_synced_at = Some(Utc::now());
          }
          SyncOutcome::Halted { reason, .. } => s.last_error = Some(reason.clone()),
          SyncOutcome::AlreadyRunning => {}
        }
      }),
      Err(e) => {
        warn!(error = %e, "Sync aborted by store failure");
        let message = e.to_string();
        self.inner.status.send_modify(|s| s.last_error = Some(message));
      }
    }

    result
  }

  async fn drain(&self) -> Result<SyncReport, StoreError> {
    let queue = &self.inner.queue;
    let mut applied = 0;

    // Re-list after each pass so writes queued mid-drain go out too
    loop {
      let batch = queue.list_pending()?;
      if batch.is_empty() {
        break;
      }
      debug!(count = batch.len(), "Draining pending operations");

      for op in batch {
        match self
          .inner
          .remote
          .apply(&op.resource, op.kind, &op.payload)
          .await
        {
          Ok(()) => {
            queue.remove(&op.id)?;
            applied += 1;
            self.refresh_pending_count()?;
          }
          Err(e) => {
            let pending_count = queue.pending_count()?;
            warn!(
              operation_id = %op.id,
              resource = %op.resource,
              kind = %op.kind,
              reason = %e.reason,
              pending_count,
              "Sync halted"
            );
            return Ok(SyncReport {
              outcome: SyncOutcome::Halted {
                operation_id: op.id,
                reason: e.reason,
              },
              applied,
              pending_count,
            });
          }
        }
      }
    }

    let pending_count = queue.pending_count()?;
    info!(applied, pending_count, "Sync completed");
    Ok(SyncReport {
      outcome: SyncOutcome::Completed,
      applied,
      pending_count,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::queue::OperationKind;
  use crate::sync::mock::RecordingRemote;
  use serde_json::json;
  use std::time::Duration;

  fn setup(remote: RecordingRemote) -> (OperationQueue, Arc<RecordingRemote>, SyncCoordinator) {
    let queue = OperationQueue::new(Database::open_in_memory().unwrap());
    let remote = Arc::new(remote);
    let coordinator = SyncCoordinator::new(queue.clone(), remote.clone());
    (queue, remote, coordinator)
  }

  fn enqueue(queue: &OperationQueue, name: &str) -> String {
    queue
      .enqueue("leads", OperationKind::Insert, json!({ "name": name }))
      .unwrap()
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let (queue, remote, coordinator) = setup(RecordingRemote::new());
    enqueue(&queue, "A");
    enqueue(&queue, "B");
    enqueue(&queue, "C");

    let report = coordinator.request_sync().await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.applied, 3);
    assert_eq!(report.pending_count, 0);
    assert_eq!(remote.attempts(), vec!["A", "B", "C"]);
    assert_eq!(queue.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_halts_on_first_failure() {
    let (queue, remote, coordinator) = setup(RecordingRemote::new());
    enqueue(&queue, "A");
    let b = enqueue(&queue, "B");
    let c = enqueue(&queue, "C");
    remote.fail_on("B");

    let report = coordinator.request_sync().await.unwrap();

    assert!(report.is_halted());
    assert_eq!(report.applied, 1);
    assert_eq!(report.pending_count, 2);
    // C is never attempted
    assert_eq!(remote.attempts(), vec!["A", "B"]);

    let remaining: Vec<String> = queue
      .list_pending()
      .unwrap()
      .into_iter()
      .map(|op| op.id)
      .collect();
    assert_eq!(remaining, vec![b.clone(), c]);

    let status = coordinator.status();
    assert_eq!(status.pending_count, 2);
    assert!(!status.is_syncing);
    assert_eq!(status.last_error.as_deref(), Some("rejected B"));
    match report.outcome {
      SyncOutcome::Halted { operation_id, .. } => assert_eq!(operation_id, b),
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_manual_retry_resumes_from_head() {
    let (queue, remote, coordinator) = setup(RecordingRemote::new());
    enqueue(&queue, "A");
    enqueue(&queue, "B");
    enqueue(&queue, "C");
    remote.fail_on("B");

    coordinator.request_sync().await.unwrap();
    remote.heal("B");
    let report = coordinator.request_sync().await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(remote.applied(), vec!["A", "B", "C"]);
    assert_eq!(coordinator.status().last_error, None);
    assert!(coordinator.status().last_synced_at.is_some());
  }

  #[tokio::test]
  async fn test_concurrent_requests_apply_each_operation_once() {
    let (queue, remote, coordinator) =
      setup(RecordingRemote::new().with_delay(Duration::from_millis(20)));
    enqueue(&queue, "A");
    enqueue(&queue, "B");

    let (first, second) = tokio::join!(coordinator.request_sync(), coordinator.request_sync());

    assert_eq!(first.unwrap().outcome, SyncOutcome::Completed);
    assert_eq!(second.unwrap().outcome, SyncOutcome::AlreadyRunning);
    assert_eq!(remote.attempts(), vec!["A", "B"]);
    assert!(!coordinator.is_syncing());
  }

  #[tokio::test]
  async fn test_is_syncing_visible_during_drain() {
    let (queue, _remote, coordinator) =
      setup(RecordingRemote::new().with_delay(Duration::from_millis(50)));
    enqueue(&queue, "A");
    let mut status = coordinator.subscribe();

    let background = coordinator.clone();
    let handle = tokio::spawn(async move { background.request_sync().await });

    status.wait_for(|s| s.is_syncing).await.unwrap();
    status.wait_for(|s| !s.is_syncing).await.unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(coordinator.pending_count(), 0);
  }

  #[tokio::test]
  async fn test_empty_queue_completes_immediately() {
    let (_queue, remote, coordinator) = setup(RecordingRemote::new());

    let report = coordinator.request_sync().await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.applied, 0);
    assert!(remote.attempts().is_empty());
  }

  #[tokio::test]
  async fn test_initial_status_reflects_existing_queue() {
    let queue = OperationQueue::new(Database::open_in_memory().unwrap());
    enqueue(&queue, "A");

    let coordinator = SyncCoordinator::new(queue, Arc::new(RecordingRemote::new()));
    assert_eq!(coordinator.pending_count(), 1);
  }
}
