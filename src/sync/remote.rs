//! Remote service contract and its HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::RequestBuilder;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::RemoteApplyError;
use crate::queue::OperationKind;

/// Applies a single queued write to the remote data service.
///
/// Timeouts, network errors and rejections all come back as `RemoteApplyError`;
/// the coordinator treats them the same way.
#[async_trait]
pub trait RemoteService: Send + Sync {
  async fn apply(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: &Value,
  ) -> Result<(), RemoteApplyError>;
}

/// Client for a PostgREST-style row API.
///
/// - insert: `POST {base}/{resource}` with the row as body
/// - update: `PATCH {base}/{resource}?id=eq.{id}` with the row as body
/// - delete: `DELETE {base}/{resource}?id=eq.{id}`
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote url {}: {}", base_url, e))?;

    // Url::join drops the last segment unless the path ends with '/'
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// URL of `resource` under the base path.
  ///
  /// The resource must be a single plain path segment, so it can never point
  /// the credentials at another host or path.
  fn endpoint(&self, resource: &str) -> Result<Url, RemoteApplyError> {
    let plain = !resource.is_empty()
      && resource != "."
      && resource != ".."
      && !resource.contains(['/', '\\', ':', '?', '#', '%']);
    if !plain {
      return Err(RemoteApplyError::new(format!(
        "invalid resource '{}': expected a plain table name",
        resource
      )));
    }

    self
      .base
      .join(resource)
      .map_err(|e| RemoteApplyError::new(format!("invalid resource '{}': {}", resource, e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.api_key {
      Some(key) => request.header("apikey", key).bearer_auth(key),
      None => request,
    }
  }

  /// Read rows from `resource`, passing `filters` through as query parameters.
  pub async fn select(&self, resource: &str, filters: &[(String, String)]) -> Result<Value> {
    let url = self.endpoint(resource).map_err(|e| eyre!("{}", e.reason))?;

    let response = self
      .authorize(self.client.get(url).query(filters))
      .send()
      .await
      .map_err(|e| eyre!("Failed to read {}: {}", resource, e))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(eyre!("Failed to read {}: {} {}", resource, status, body.trim()));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", resource, e))
  }
}

/// Extract the row identifier from a payload: either the value itself or its `id` field.
fn row_id(payload: &Value) -> Result<String, RemoteApplyError> {
  let id = match payload {
    Value::Object(map) => map.get("id"),
    other => Some(other),
  };

  match id {
    Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
    Some(Value::Number(n)) => Ok(n.to_string()),
    _ => Err(RemoteApplyError::new("payload has no usable id")),
  }
}

#[async_trait]
impl RemoteService for HttpRemote {
  async fn apply(
    &self,
    resource: &str,
    kind: OperationKind,
    payload: &Value,
  ) -> Result<(), RemoteApplyError> {
    let url = self.endpoint(resource)?;

    let request = match kind {
      OperationKind::Insert => self.client.post(url).json(payload),
      OperationKind::Update => {
        let filter = format!("eq.{}", row_id(payload)?);
        self.client.patch(url).query(&[("id", filter)]).json(payload)
      }
      OperationKind::Delete => {
        let filter = format!("eq.{}", row_id(payload)?);
        self.client.delete(url).query(&[("id", filter)])
      }
    };

    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| RemoteApplyError::new(format!("{} {} failed: {}", kind, resource, e)))?;

    let status = response.status();
    if status.is_success() {
      debug!(resource, %kind, %status, "Remote apply succeeded");
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteApplyError::new(format!(
      "{} {} rejected with {}: {}",
      kind,
      resource,
      status,
      body.trim()
    )))
  }
}
