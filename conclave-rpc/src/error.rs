use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io;

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// The JSON-RPC 2.0 error object, `{code, message, data?}`.
///
/// This is the error shape that travels on the wire: method handlers raise it
/// to reject a request, and `acall` awaiters receive it when the remote side
/// replies with an error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
  pub code: i64,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<JsonValue>,
}

impl RemoteError {
  pub fn new(code: i64, message: impl Into<String>) -> Self {
    RemoteError {
      code,
      message: message.into(),
      data: None,
    }
  }

  pub fn with_data(mut self, data: JsonValue) -> Self {
    self.data = Some(data);
    self
  }

  pub fn method_not_found(method: &str) -> Self {
    RemoteError::new(METHOD_NOT_FOUND, "Method not found").with_data(JsonValue::from(method))
  }

  /// Wraps a handler failure as `-32603` with a `"<kind>:<text>"` message.
  pub fn internal(kind: &str, text: impl std::fmt::Display) -> Self {
    RemoteError::new(INTERNAL_ERROR, format!("{}:{}", kind, text))
  }
}

/// Errors surfaced to callers of the RPC runtime.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
  #[error(transparent)]
  Remote(#[from] RemoteError),

  #[error("request timed out")]
  Timeout,

  #[error("request cancelled")]
  Cancelled,

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl RpcError {
  pub fn kind(&self) -> &'static str {
    match self {
      RpcError::Remote(_) => "RemoteError",
      RpcError::Timeout => "Timeout",
      RpcError::Cancelled => "Cancelled",
      RpcError::Io(_) => "Io",
      RpcError::Json(_) => "Json",
      RpcError::Internal(_) => "Internal",
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, RpcError::Timeout)
  }

  /// Converts a handler failure into the error object sent back to the peer.
  /// A typed remote error keeps its `{code, message, data?}`; anything else
  /// becomes `-32603` with a `"<kind>:<text>"` message.
  pub fn into_remote(self) -> RemoteError {
    match self {
      RpcError::Remote(err) => err,
      other => RemoteError::internal(other.kind(), &other),
    }
  }
}

/// Receive-side errors. Frames that fail here are dropped with a log line and
/// never produce a reply.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
  #[error("malformed JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("frame is not a JSON object")]
  NotAnObject,

  #[error("not a JSON-RPC 2.0 frame")]
  BadVersion,

  #[error("datagram of {len} bytes exceeds the {max} byte limit")]
  Oversized { len: usize, max: usize },
}
