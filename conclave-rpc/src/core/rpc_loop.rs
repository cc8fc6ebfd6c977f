use crate::core::endpoint::Endpoint;
use crate::core::parser::FrameParser;
use crate::core::rpc_peer::{Cipher, RpcPeer, TimerToken};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, trace, warn};

/// Reap cadence for outstanding calls, standing in for the application-wide
/// tick of the hosting process.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long the loop sleeps when no timer is armed.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(500);

/// The component driven by the RPC main loop: inbound requests, observed
/// replies and timer expirations all land here, serialized on the loop task.
pub trait Handler {
  /// Handles an inbound request and produces the reply value. Returning
  /// `Ok(JsonValue::Null)` suppresses the reply; returning an error sends an
  /// error frame back to the peer.
  fn handle_request(
    &mut self,
    peer: SocketAddr,
    method: &str,
    params: JsonValue,
  ) -> Result<JsonValue, crate::error::RpcError>;

  /// Observes a reply to an earlier outbound call of `method`. Returns
  /// `false` when no reply handler is bound for the method.
  fn handle_reply(&mut self, peer: SocketAddr, method: &str, result: JsonValue) -> bool;

  /// A one-shot timer scheduled through the peer handle has expired.
  fn handle_timer(&mut self, token: TimerToken);
}

/// A structure holding the state of the main loop for handling RPC's.
pub struct RpcLoop {
  endpoint: Endpoint,
  parser: FrameParser,
  peer: RpcPeer,
}

impl RpcLoop {
  pub fn new(endpoint: Endpoint, max_rpc_payload_size: usize, cipher: Box<dyn Cipher>) -> Self {
    let peer = RpcPeer::new(endpoint.primary(), cipher);
    RpcLoop {
      endpoint,
      parser: FrameParser::new(max_rpc_payload_size),
      peer,
    }
  }

  /// Gets a handle onto the runtime shared with callers of `call`/`acall`.
  pub fn peer(&self) -> RpcPeer {
    self.peer.clone()
  }

  /// Runs the event loop until `shutdown` signals. One task runs this loop;
  /// socket readiness, timer expirations and the reaper tick are all
  /// delivered to `handler` from here, never concurrently.
  pub async fn mainloop<H: Handler>(&mut self, handler: &mut H, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; self.parser.max_payload() + 1];
    let mut tick = tokio::time::interval(TICK_INTERVAL);

    loop {
      // Deliver every due timer before going back to sleep.
      let next_timer = loop {
        match self.peer.check_timers() {
          Some(Ok(token)) => handler.handle_timer(token),
          Some(Err(wait)) => break wait,
          None => break MAX_IDLE_WAIT,
        }
      };

      tokio::select! {
        ready = self.endpoint.readable() => {
          match ready {
            Ok(index) => {
              self.endpoint.drain(index, &mut buf, |bytes, peer_addr| {
                self.process_datagram(handler, bytes, peer_addr);
              });
            },
            Err(err) => error!("[RPC] socket readiness failed: {}", err),
          }
        },
        _ = tokio::time::sleep(next_timer) => {},
        _ = tick.tick() => self.peer.reap_expired(),
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            info!("[RPC] shutting down main loop");
            self.peer.cancel_all();
            self.peer.clear_timers();
            break;
          }
        },
      }
    }
  }

  /// Dispatches one inbound datagram: a request goes to the handler (with
  /// the reply sent back to the peer), a result or error frame completes the
  /// matching outstanding call. Anything else is logged and dropped.
  fn process_datagram<H: Handler>(&self, handler: &mut H, raw: &[u8], peer_addr: SocketAddr) {
    let plain = self.peer.decrypt(peer_addr, raw.to_vec());
    let mut obj = match self.parser.parse(&plain) {
      Ok(obj) => obj,
      Err(err) => {
        warn!("[RPC] dropping datagram from {}: {}", peer_addr, err);
        return;
      },
    };

    if let Some(method) = obj.method().map(str::to_owned) {
      trace!("[RPC] request '{}' <-- {}", method, peer_addr);
      let params = obj.take_params();
      let result = handler.handle_request(peer_addr, &method, params);
      match result {
        Ok(JsonValue::Null) => {},
        Ok(value) => self.peer.respond(peer_addr, obj.raw_id(), Ok(value)),
        Err(err) => self.peer.respond(peer_addr, obj.raw_id(), Err(err.into_remote())),
      }
      return;
    }

    if obj.is_response() {
      let Some(id) = obj.id().map(str::to_owned) else {
        warn!("[RPC] response without a string id from {}", peer_addr);
        return;
      };
      match obj.into_response() {
        Ok(Ok(result)) => {
          let completed = self.peer.complete(&id, Ok(result.clone()));
          // The method that originated the call is the id prefix.
          let method = id.split(':').next().unwrap_or_default();
          let observed = handler.handle_reply(peer_addr, method, result);
          if !completed && !observed {
            error!("[RPC] received result for unknown call '{}'", id);
          }
        },
        Ok(Err(remote)) => {
          if !self.peer.complete(&id, Err(remote.into())) {
            error!("[RPC] received error for unknown call '{}'", id);
          }
        },
        Err(msg) => warn!("[RPC] failed to parse response from {}: {}", peer_addr, msg),
      }
      return;
    }

    warn!(
      "[RPC] dropping frame without method, result or error from {}",
      peer_addr
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::rpc_peer::NullCipher;
  use crate::error::RpcError;
  use serde_json::json;
  use tokio::net::UdpSocket;

  struct EchoHandler {
    replies: Vec<(String, JsonValue)>,
    timers: Vec<TimerToken>,
  }

  impl EchoHandler {
    fn new() -> Self {
      EchoHandler {
        replies: Vec::new(),
        timers: Vec::new(),
      }
    }
  }

  impl Handler for EchoHandler {
    fn handle_request(
      &mut self,
      _peer: SocketAddr,
      method: &str,
      params: JsonValue,
    ) -> Result<JsonValue, RpcError> {
      match method {
        "Echo" => Ok(params),
        "Quiet" => Ok(JsonValue::Null),
        other => Err(crate::error::RemoteError::method_not_found(other).into()),
      }
    }

    fn handle_reply(&mut self, _peer: SocketAddr, method: &str, result: JsonValue) -> bool {
      if method == "Echo" {
        self.replies.push((method.to_string(), result));
        return true;
      }
      false
    }

    fn handle_timer(&mut self, token: TimerToken) {
      self.timers.push(token);
    }
  }

  async fn rpc_loop() -> RpcLoop {
    let endpoint = Endpoint::bind(&[("127.0.0.1".to_string(), 0)]).await.unwrap();
    RpcLoop::new(endpoint, 4096, Box::new(NullCipher))
  }

  #[tokio::test]
  async fn request_gets_a_result_reply() {
    let rpc = rpc_loop().await;
    let mut handler = EchoHandler::new();
    let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

    let frame = json!({"jsonrpc": "2.0", "id": "x", "method": "Echo", "params": [1, 2]});
    rpc.process_datagram(&mut handler, frame.to_string().as_bytes(), remote);
    // The reply leaves on the primary socket; here it only must not panic
    // and must not consume a pending record.
    assert_eq!(rpc.peer().pending_len(), 0);
  }

  #[tokio::test]
  async fn result_frame_completes_pending_and_feeds_reply_handler() {
    let rpc = rpc_loop().await;
    let mut handler = EchoHandler::new();
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let peer = rpc.peer();
    let caller = peer.clone();
    let task = tokio::spawn(async move {
      caller
        .acall_with_timeout(remote_addr, "Echo", json!([1]), Duration::from_secs(5))
        .await
    });
    while peer.pending_len() == 0 {
      tokio::task::yield_now().await;
    }

    let frame = json!({"jsonrpc": "2.0", "id": "Echo:1", "result": [1]});
    rpc.process_datagram(&mut handler, frame.to_string().as_bytes(), remote_addr);

    assert_eq!(task.await.unwrap().unwrap(), json!([1]));
    assert_eq!(handler.replies, vec![("Echo".to_string(), json!([1]))]);
    assert_eq!(peer.pending_len(), 0);
  }

  #[tokio::test]
  async fn unknown_result_is_dropped_without_state_change() {
    let rpc = rpc_loop().await;
    let mut handler = EchoHandler::new();
    let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

    let frame = json!({"jsonrpc": "2.0", "id": "Nope:9", "result": 1});
    rpc.process_datagram(&mut handler, frame.to_string().as_bytes(), remote);
    assert!(handler.replies.is_empty());
    assert_eq!(rpc.peer().pending_len(), 0);
  }

  #[tokio::test]
  async fn error_frame_resumes_the_awaiter_with_the_remote_error() {
    let rpc = rpc_loop().await;
    let mut handler = EchoHandler::new();
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let caller = rpc.peer();
    let task = tokio::spawn(async move {
      caller
        .acall_with_timeout(remote_addr, "Echo", JsonValue::Null, Duration::from_secs(5))
        .await
    });
    while rpc.peer().pending_len() == 0 {
      tokio::task::yield_now().await;
    }

    let frame = json!({
      "jsonrpc": "2.0",
      "id": "Echo:1",
      "error": {"code": -32601, "message": "Method not found", "data": "Echo"},
    });
    rpc.process_datagram(&mut handler, frame.to_string().as_bytes(), remote_addr);

    match task.await.unwrap().unwrap_err() {
      RpcError::Remote(err) => assert_eq!(err.code, -32601),
      other => panic!("expected a remote error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn bad_version_frames_are_dropped() {
    let rpc = rpc_loop().await;
    let mut handler = EchoHandler::new();
    let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    rpc.process_datagram(
      &mut handler,
      br#"{"jsonrpc": "1.0", "id": "x", "method": "Echo"}"#,
      remote,
    );
    rpc.process_datagram(&mut handler, b"not json at all", remote);
    assert!(handler.replies.is_empty());
  }

  #[tokio::test]
  async fn mainloop_fires_timers_and_stops_on_shutdown() {
    let mut rpc = rpc_loop().await;
    let peer = rpc.peer();
    let mut handler = EchoHandler::new();

    peer.schedule_timer(TimerToken(7), Duration::from_millis(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_task = async {
      rpc.mainloop(&mut handler, shutdown_rx).await;
    };
    let driver = async {
      tokio::time::sleep(Duration::from_millis(100)).await;
      shutdown_tx.send(true).unwrap();
    };
    tokio::join!(loop_task, driver);

    assert_eq!(handler.timers, vec![TimerToken(7)]);
  }
}
