use crate::error::RemoteError;
use serde_json::Value as JsonValue;

/// A parsed JSON-RPC frame, still in its raw `serde_json::Value` shape.
///
/// A frame is one of three kinds: a request (`method` present), a result
/// (`result` present) or an error (`error` present). Fields whose value is
/// JSON `null` are treated the same as absent fields.
#[derive(Debug, Clone)]
pub struct RpcObject(pub JsonValue);

impl RpcObject {
  pub fn method(&self) -> Option<&str> {
    self.0.get("method").and_then(JsonValue::as_str)
  }

  /// The correlation id in its string form, used to look up outstanding
  /// calls. Ids issued by this runtime are always strings.
  pub fn id(&self) -> Option<&str> {
    self.0.get("id").and_then(JsonValue::as_str)
  }

  /// The id exactly as the peer sent it, echoed back verbatim in replies.
  /// Missing ids echo as `null`.
  pub fn raw_id(&self) -> JsonValue {
    self.0.get("id").cloned().unwrap_or(JsonValue::Null)
  }

  pub fn take_params(&mut self) -> JsonValue {
    self
      .0
      .get_mut("params")
      .map(JsonValue::take)
      .unwrap_or(JsonValue::Null)
  }

  fn field(&self, name: &str) -> Option<&JsonValue> {
    match self.0.get(name) {
      None | Some(JsonValue::Null) => None,
      Some(value) => Some(value),
    }
  }

  pub fn is_response(&self) -> bool {
    self.method().is_none() && (self.field("result").is_some() || self.field("error").is_some())
  }

  /// Converts a response frame into its payload: `Ok(value)` for a result
  /// frame, `Err(RemoteError)` for an error frame. Returns the outer `Err`
  /// when the frame is neither, or the error object fails to parse.
  pub fn into_response(mut self) -> Result<Result<JsonValue, RemoteError>, String> {
    if let Some(result) = self.0.get_mut("result") {
      if !result.is_null() {
        return Ok(Ok(result.take()));
      }
    }
    if let Some(error) = self.0.get_mut("error") {
      if !error.is_null() {
        let err = serde_json::from_value::<RemoteError>(error.take())
          .map_err(|err| format!("malformed error object: {}", err))?;
        return Ok(Err(err));
      }
    }
    Err("frame carries neither result nor error".to_string())
  }
}

impl From<JsonValue> for RpcObject {
  fn from(value: JsonValue) -> Self {
    RpcObject(value)
  }
}
