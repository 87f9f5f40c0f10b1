//! Pending operation types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What a queued write does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Insert,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Insert => "insert",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "insert" => Ok(Self::Insert),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown operation kind: {}", other)),
    }
  }
}

/// A write that has not been applied to the remote service yet.
///
/// Never mutated after enqueue; it leaves the queue only once applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: String,
  /// Remote table or collection the write targets (e.g. "leads")
  pub resource: String,
  pub kind: OperationKind,
  /// Row to insert/update, or the identifier to delete
  pub payload: Value,
  /// Milliseconds since the Unix epoch, strictly increasing across the queue
  pub created_at: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_parse_is_case_insensitive() {
    assert_eq!("Insert".parse::<OperationKind>(), Ok(OperationKind::Insert));
    assert_eq!("DELETE".parse::<OperationKind>(), Ok(OperationKind::Delete));
    assert!("upsert".parse::<OperationKind>().is_err());
  }

  #[test]
  fn test_kind_serializes_lowercase() {
    let json = serde_json::to_string(&OperationKind::Update).unwrap();
    assert_eq!(json, "\"update\"");
  }
}
