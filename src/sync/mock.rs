//! Test double for the remote service.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use super::remote::RemoteService;
use crate::error::RemoteApplyError;
use crate::queue::OperationKind;

/// Records every apply call by the payload's `name` field and fails the
/// names it has been told to reject.
#[derive(Default)]
pub struct RecordingRemote {
  attempts: Mutex<Vec<String>>,
  applied: Mutex<Vec<String>>,
  failing: Mutex<HashSet<String>>,
  delay: Option<Duration>,
}

impl RecordingRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make each apply take `delay` before answering.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn fail_on(&self, name: &str) {
    self.failing.lock().unwrap().insert(name.to_string());
  }

  pub fn heal(&self, name: &str) {
    self.failing.lock().unwrap().remove(name);
  }

  /// Every call, including rejected ones, in call order.
  pub fn attempts(&self) -> Vec<String> {
    self.attempts.lock().unwrap().clone()
  }

  /// Calls that succeeded, in call order.
  pub fn applied(&self) -> Vec<String> {
    self.applied.lock().unwrap().clone()
  }
}

fn name_of(payload: &Value) -> String {
  payload
    .get("name")
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_string()
}

#[async_trait]
impl RemoteService for RecordingRemote {
  async fn apply(
    &self,
    _resource: &str,
    _kind: OperationKind,
    payload: &Value,
  ) -> Result<(), RemoteApplyError> {
    let name = name_of(payload);
    self.attempts.lock().unwrap().push(name.clone());

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    if self.failing.lock().unwrap().contains(&name) {
      return Err(RemoteApplyError::new(format!("rejected {}", name)));
    }

    self.applied.lock().unwrap().push(name);
    Ok(())
  }
}
