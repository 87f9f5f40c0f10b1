//! Core types for the caching system.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A cached read result.
///
/// `key` is the identity; `owner_id` is carried alongside so entries can be
/// evicted per tenant, but two owners writing the same key share one row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  /// Write time in milliseconds since the Unix epoch
  pub timestamp: i64,
  pub owner_id: String,
}

impl<T> CacheEntry<T> {
  /// When the entry was written.
  pub fn cached_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp)
      .single()
      .unwrap_or_default()
  }

  /// Whether the entry is younger than `window`.
  pub fn is_fresh(&self, window: Duration) -> bool {
    Utc::now() - self.cached_at() <= window
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data still inside the fresh window.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline, or the network read failed; serving whatever was cached
  Offline,
}

/// Builder for owner-namespaced cache keys.
///
/// Produces `<name>:<owner>:<digest>` where the digest covers the sorted
/// parameters, so the same logical query always maps to the same key.
#[derive(Debug, Clone, Default)]
pub struct QueryKey {
  name: String,
  owner_id: String,
  params: BTreeMap<String, String>,
}

impl QueryKey {
  pub fn new(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      owner_id: owner_id.into(),
      params: BTreeMap::new(),
    }
  }

  pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.params.insert(key.into(), value.to_string());
    self
  }

  pub fn owner_id(&self) -> &str {
    &self.owner_id
  }

  pub fn cache_key(&self) -> String {
    if self.params.is_empty() {
      return format!("{}:{}", self.name, self.owner_id);
    }

    let mut hasher = Sha256::new();
    for (k, v) in &self.params {
      hasher.update(k.as_bytes());
      hasher.update(b"=");
      hasher.update(v.as_bytes());
      hasher.update(b"&");
    }
    let digest = hex::encode(hasher.finalize());

    // 16 hex chars is plenty to keep distinct parameter sets apart
    format!("{}:{}:{}", self.name, self.owner_id, &digest[..16])
  }

  /// Human-readable form for logs.
  pub fn description(&self) -> String {
    if self.params.is_empty() {
      return format!("{} for {}", self.name, self.owner_id);
    }
    let params: Vec<String> = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    format!("{} for {} ({})", self.name, self.owner_id, params.join(", "))
  }
}
