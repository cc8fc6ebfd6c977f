use crate::error::RemoteError;
use crate::error::RpcError;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::core::parser::JSONRPC_VERSION;

pub type RequestId = String;

pub const DEFAULT_ACALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Outstanding calls above this count suggest a peer outage or a leak.
const PENDING_HIGH_WATER: usize = 30;

/// Symmetric transformation applied to every datagram on its way in and out.
/// The default is the identity; real payload encryption plugs in here.
pub trait Cipher: Send + Sync {
  fn encrypt(&self, peer: SocketAddr, payload: Vec<u8>) -> Vec<u8>;
  fn decrypt(&self, peer: SocketAddr, payload: Vec<u8>) -> Vec<u8>;
}

#[derive(Debug, Default)]
pub struct NullCipher;

impl Cipher for NullCipher {
  fn encrypt(&self, _peer: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    payload
  }

  fn decrypt(&self, _peer: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    payload
  }
}

/// Identifies one of the node's one-shot timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub usize);

/// An outstanding awaitable call. The record lives in the register from
/// `acall` until it is completed by a reply, the reaper, or shutdown;
/// completion consumes the sender, so it can only happen once.
struct PendingCall {
  peer: SocketAddr,
  deadline: Instant,
  reply: oneshot::Sender<Result<JsonValue, RpcError>>,
}

impl PendingCall {
  fn complete(self, outcome: Result<JsonValue, RpcError>) {
    if self.reply.send(outcome).is_err() {
      trace!("[RPC] caller went away before call completion");
    }
  }
}

pub struct RpcState {
  socket: Arc<UdpSocket>,
  id_counter: AtomicU64,
  pending: Mutex<HashMap<RequestId, PendingCall>>,
  timers: Mutex<HashMap<TimerToken, Instant>>,
  cipher: Box<dyn Cipher>,
}

/// A cloneable handle onto the RPC runtime state: issues calls, completes
/// them from the receive path, and owns the timer table.
pub struct RpcPeer(Arc<RpcState>);

impl Clone for RpcPeer {
  fn clone(&self) -> Self {
    RpcPeer(self.0.clone())
  }
}

impl RpcPeer {
  /// `socket` is the primary socket: the single egress for every outbound
  /// frame, requests and replies alike.
  pub fn new(socket: Arc<UdpSocket>, cipher: Box<dyn Cipher>) -> Self {
    RpcPeer(Arc::new(RpcState {
      socket,
      id_counter: AtomicU64::new(1),
      pending: Mutex::new(HashMap::new()),
      timers: Mutex::new(HashMap::new()),
      cipher,
    }))
  }

  fn send(&self, peer: SocketAddr, frame: &JsonValue) {
    let payload = match serde_json::to_vec(frame) {
      Ok(payload) => payload,
      Err(err) => {
        error!("[RPC] failed to encode frame: {}", err);
        return;
      },
    };
    let payload = self.0.cipher.encrypt(peer, payload);
    match self.0.socket.try_send_to(&payload, peer) {
      Ok(sent) if sent != payload.len() => {
        error!(
          "[RPC] sent data are not complete ({} != {})",
          sent,
          payload.len()
        );
      },
      Ok(_) => {},
      Err(err) => error!("[RPC] send to {} failed: {}", peer, err),
    }
  }

  pub(crate) fn decrypt(&self, peer: SocketAddr, payload: Vec<u8>) -> Vec<u8> {
    self.0.cipher.decrypt(peer, payload)
  }

  /// Fire-and-forget request. Returns the request id `"<method>:<n>"`; the
  /// counter is process-wide and strictly increasing, so ids are never
  /// reused. Transport failures are logged, not surfaced.
  pub fn call(&self, peer: SocketAddr, method: &str, params: JsonValue) -> RequestId {
    let request_id = format!(
      "{}:{}",
      method,
      self.0.id_counter.fetch_add(1, Ordering::Relaxed)
    );
    trace!("[RPC] call {} --> {}", request_id, peer);
    let frame = json!({
      "id": request_id,
      "jsonrpc": JSONRPC_VERSION,
      "method": method,
      "params": params,
    });
    self.send(peer, &frame);
    request_id
  }

  /// Awaitable request with the default 3 second timeout.
  pub async fn acall(
    &self,
    peer: SocketAddr,
    method: &str,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    self
      .acall_with_timeout(peer, method, params, DEFAULT_ACALL_TIMEOUT)
      .await
  }

  /// Issues a request and suspends the caller until a reply arrives, the
  /// timeout passes, or the runtime shuts down.
  pub async fn acall_with_timeout(
    &self,
    peer: SocketAddr,
    method: &str,
    params: JsonValue,
    timeout: Duration,
  ) -> Result<JsonValue, RpcError> {
    let (tx, rx) = oneshot::channel();
    let request_id = self.call(peer, method, params);
    {
      let mut pending = self.0.pending.lock();
      pending.insert(
        request_id.clone(),
        PendingCall {
          peer,
          deadline: Instant::now() + timeout,
          reply: tx,
        },
      );
    }
    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(_)) => Err(RpcError::Cancelled),
      Err(_) => {
        // The reaper may already have collected the record; either way it
        // must be gone before the timeout error is returned.
        self.0.pending.lock().remove(&request_id);
        Err(RpcError::Timeout)
      },
    }
  }

  /// Sends a reply to an inbound request, echoing the peer's id verbatim.
  pub(crate) fn respond(
    &self,
    peer: SocketAddr,
    id: JsonValue,
    result: Result<JsonValue, RemoteError>,
  ) {
    let mut frame = json!({"id": id, "jsonrpc": JSONRPC_VERSION});
    match result {
      Ok(value) => frame["result"] = value,
      Err(err) => frame["error"] = json!(err),
    }
    self.send(peer, &frame);
  }

  /// Completes the outstanding call registered under `id`, if any. Returns
  /// whether a record was found. The record is removed before the awaiter
  /// is resumed, so completion is one-shot by construction.
  pub(crate) fn complete(&self, id: &str, outcome: Result<JsonValue, RpcError>) -> bool {
    let call = self.0.pending.lock().remove(id);
    match call {
      Some(call) => {
        trace!("[RPC] completing call {}", id);
        call.complete(outcome);
        true
      },
      None => false,
    }
  }

  /// Times out every outstanding call whose deadline has passed. Driven by
  /// the periodic tick.
  pub fn reap_expired(&self) {
    let now = Instant::now();
    let expired: Vec<(RequestId, PendingCall)> = {
      let mut pending = self.0.pending.lock();
      let ids: Vec<RequestId> = pending
        .iter()
        .filter(|(_, call)| call.deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();
      let expired = ids
        .into_iter()
        .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
        .collect();
      if pending.len() > PENDING_HIGH_WATER {
        warn!(
          "[RPC] too high number ({}) of registered calls",
          pending.len()
        );
      }
      expired
    };
    for (id, call) in expired {
      warn!("[RPC] call {} to {} timed out", id, call.peer);
      call.complete(Err(RpcError::Timeout));
    }
  }

  /// Cancels every outstanding call; used on shutdown.
  pub fn cancel_all(&self) {
    let drained: Vec<(RequestId, PendingCall)> = {
      let mut pending = self.0.pending.lock();
      pending.drain().collect()
    };
    for (id, call) in drained {
      trace!("[RPC] cancelling call {}", id);
      call.complete(Err(RpcError::Cancelled));
    }
  }

  pub fn pending_len(&self) -> usize {
    self.0.pending.lock().len()
  }

  /// Arms (or re-arms) a one-shot timer. Scheduling an already armed token
  /// replaces its deadline, which is what `restart` means.
  pub fn schedule_timer(&self, token: TimerToken, after: Duration) {
    self.0.timers.lock().insert(token, Instant::now() + after);
  }

  pub fn cancel_timer(&self, token: TimerToken) {
    self.0.timers.lock().remove(&token);
  }

  pub(crate) fn clear_timers(&self) {
    self.0.timers.lock().clear();
  }

  /// Checks the most imminent timer.
  ///
  /// - `Some(Ok(token))`: the timer has fired; it is already disarmed.
  /// - `Some(Err(duration))`: time until the next timer expires.
  /// - `None`: no timer is armed.
  pub(crate) fn check_timers(&self) -> Option<Result<TimerToken, Duration>> {
    let mut timers = self.0.timers.lock();
    let (token, deadline) = timers
      .iter()
      .min_by_key(|(_, deadline)| **deadline)
      .map(|(token, deadline)| (*token, *deadline))?;
    let now = Instant::now();
    if deadline > now {
      return Some(Err(deadline - now));
    }
    timers.remove(&token);
    Some(Ok(token))
  }
}
