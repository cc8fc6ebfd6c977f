use crate::error::{RemoteError, RpcError};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::error;

pub const PING_METHOD: &str = "Ping";

pub type RequestFn<S> = fn(&mut S, SocketAddr, JsonValue) -> Result<JsonValue, RpcError>;
pub type ReplyFn<S> = fn(&mut S, SocketAddr, JsonValue);

/// The two dispatch tables of the RPC runtime: inbound requests by method
/// name, and observed replies by the method that originated the call.
///
/// Handlers are registered up front, builder style, by the component that
/// owns the state `S`. Registering a method twice is an error; the first
/// registration wins.
pub struct MethodRegistry<S> {
  requests: HashMap<&'static str, RequestFn<S>>,
  replies: HashMap<&'static str, ReplyFn<S>>,
}

impl<S> Default for MethodRegistry<S> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S> MethodRegistry<S> {
  pub fn new() -> Self {
    MethodRegistry {
      requests: HashMap::new(),
      replies: HashMap::new(),
    }
  }

  pub fn request(mut self, method: &'static str, handler: RequestFn<S>) -> Self {
    if self.requests.contains_key(method) {
      error!("[RPC] method '{}' is already bound", method);
    } else {
      self.requests.insert(method, handler);
    }
    self
  }

  pub fn reply(mut self, method: &'static str, handler: ReplyFn<S>) -> Self {
    if self.replies.contains_key(method) {
      error!("[RPC] reply handler for '{}' is already bound", method);
    } else {
      self.replies.insert(method, handler);
    }
    self
  }

  /// Routes an inbound request. `Ping` is built in: a null `params` answers
  /// `"Pong"`, any other value (an empty list included) echoes back
  /// unchanged.
  pub fn dispatch_request(
    &self,
    state: &mut S,
    peer: SocketAddr,
    method: &str,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    if method == PING_METHOD {
      if params.is_null() {
        return Ok(json!("Pong"));
      }
      return Ok(params);
    }
    match self.requests.get(method) {
      Some(handler) => handler(state, peer, params),
      None => Err(RemoteError::method_not_found(method).into()),
    }
  }

  /// Routes a reply to an earlier outbound call. Returns `false` when no
  /// reply handler is bound for `method`.
  pub fn dispatch_reply(
    &self,
    state: &mut S,
    peer: SocketAddr,
    method: &str,
    result: JsonValue,
  ) -> bool {
    match self.replies.get(method) {
      Some(handler) => {
        handler(state, peer, result);
        true
      },
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::METHOD_NOT_FOUND;

  fn addr() -> SocketAddr {
    "127.0.0.1:9999".parse().unwrap()
  }

  #[derive(Default)]
  struct Recorder {
    requests: Vec<JsonValue>,
    replies: Vec<JsonValue>,
  }

  fn record_request(
    state: &mut Recorder,
    _peer: SocketAddr,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    state.requests.push(params);
    Ok(json!({"ok": true}))
  }

  fn record_reply(state: &mut Recorder, _peer: SocketAddr, result: JsonValue) {
    state.replies.push(result);
  }

  #[test]
  fn ping_returns_pong_only_for_null_params() {
    let registry = MethodRegistry::<Recorder>::new();
    let mut state = Recorder::default();
    let pong = registry
      .dispatch_request(&mut state, addr(), "Ping", JsonValue::Null)
      .unwrap();
    assert_eq!(pong, json!("Pong"));

    // An empty list is not null; it echoes back as-is.
    let echoed = registry
      .dispatch_request(&mut state, addr(), "Ping", json!([]))
      .unwrap();
    assert_eq!(echoed, json!([]));

    let echoed = registry
      .dispatch_request(&mut state, addr(), "Ping", json!([1, "x", null]))
      .unwrap();
    assert_eq!(echoed, json!([1, "x", null]));
  }

  #[test]
  fn unknown_method_yields_method_not_found() {
    let registry = MethodRegistry::<Recorder>::new();
    let mut state = Recorder::default();
    let err = registry
      .dispatch_request(&mut state, addr(), "Nope", JsonValue::Null)
      .unwrap_err();
    match err {
      RpcError::Remote(remote) => {
        assert_eq!(remote.code, METHOD_NOT_FOUND);
        assert_eq!(remote.data, Some(json!("Nope")));
      },
      other => panic!("expected a remote error, got {:?}", other),
    }
  }

  #[test]
  fn registered_handlers_receive_params() {
    let registry = MethodRegistry::new()
      .request("Record", record_request)
      .reply("Record", record_reply);
    let mut state = Recorder::default();

    registry
      .dispatch_request(&mut state, addr(), "Record", json!({"n": 1}))
      .unwrap();
    assert_eq!(state.requests, vec![json!({"n": 1})]);

    assert!(registry.dispatch_reply(&mut state, addr(), "Record", json!({"n": 2})));
    assert_eq!(state.replies, vec![json!({"n": 2})]);

    assert!(!registry.dispatch_reply(&mut state, addr(), "Other", JsonValue::Null));
  }

  #[test]
  fn duplicate_registration_keeps_the_first_handler() {
    fn second(
      _state: &mut Recorder,
      _peer: SocketAddr,
      _params: JsonValue,
    ) -> Result<JsonValue, RpcError> {
      Ok(json!("second"))
    }

    let registry = MethodRegistry::new()
      .request("Record", record_request)
      .request("Record", second);
    let mut state = Recorder::default();
    let result = registry
      .dispatch_request(&mut state, addr(), "Record", JsonValue::Null)
      .unwrap();
    assert_eq!(result, json!({"ok": true}));
  }
}
