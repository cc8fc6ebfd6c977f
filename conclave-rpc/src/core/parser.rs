use crate::core::rpc_object::RpcObject;
use crate::error::ReadError;
use serde_json::Value as JsonValue;

pub const JSONRPC_VERSION: &str = "2.0";

/// Validates a raw datagram and turns it into an [`RpcObject`].
///
/// Frames larger than the configured payload ceiling, frames that are not a
/// JSON object and frames whose `jsonrpc` field is not `"2.0"` are rejected;
/// the caller logs and drops them without replying.
#[derive(Debug)]
pub struct FrameParser {
  max_payload: usize,
}

impl FrameParser {
  pub fn new(max_payload: usize) -> Self {
    FrameParser { max_payload }
  }

  pub fn max_payload(&self) -> usize {
    self.max_payload
  }

  pub fn parse(&self, raw: &[u8]) -> Result<RpcObject, ReadError> {
    if raw.len() > self.max_payload {
      return Err(ReadError::Oversized {
        len: raw.len(),
        max: self.max_payload,
      });
    }
    let value: JsonValue = serde_json::from_slice(raw)?;
    if !value.is_object() {
      return Err(ReadError::NotAnObject);
    }
    if value.get("jsonrpc").and_then(JsonValue::as_str) != Some(JSONRPC_VERSION) {
      return Err(ReadError::BadVersion);
    }
    Ok(RpcObject(value))
  }
}
