use crate::config::{ConfigError, RaftSettings};
use crate::raft::{
  Peer, RaftNode, RoleState, RoleStateReceiver, ELECTION_TIMER, HEARTBEAT_TIMER,
};
use anyhow::anyhow;
use conclave_rpc::core::endpoint::Endpoint;
use conclave_rpc::core::registry::MethodRegistry;
use conclave_rpc::core::rpc_loop::{Handler, RpcLoop};
use conclave_rpc::core::rpc_peer::{NullCipher, RpcPeer, TimerToken};
use conclave_rpc::error::RpcError;
use serde_json::Value as JsonValue;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

/// Glues the role machine to the RPC loop: requests, observed replies and
/// timer expirations are routed through the method registry into the
/// [`RaftNode`].
struct RaftCore {
  node: RaftNode,
  registry: MethodRegistry<RaftNode>,
}

impl Handler for RaftCore {
  fn handle_request(
    &mut self,
    peer: SocketAddr,
    method: &str,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    self
      .registry
      .dispatch_request(&mut self.node, peer, method, params)
  }

  fn handle_reply(&mut self, peer: SocketAddr, method: &str, result: JsonValue) -> bool {
    self
      .registry
      .dispatch_reply(&mut self.node, peer, method, result)
  }

  fn handle_timer(&mut self, token: TimerToken) {
    match token {
      ELECTION_TIMER => self.node.on_election_timeout(),
      HEARTBEAT_TIMER => self.node.on_heartbeat_timeout(),
      other => warn!("[Raft] unexpected timer token {:?}", other),
    }
  }
}

/// A single consensus cluster member: the bound sockets, the RPC runtime
/// and the Raft role machine, wired together and ready to start.
pub struct ClusterNode {
  rpc_loop: RpcLoop,
  core: RaftCore,
  role_rx: RoleStateReceiver,
  local_addr: SocketAddr,
}

impl ClusterNode {
  /// Binds the configured listeners and builds the peer table. The node
  /// does not exchange any traffic until [`ClusterNode::start`].
  pub async fn new(settings: RaftSettings) -> Result<Self, NodeError> {
    settings.validate()?;

    let endpoint = Endpoint::bind(&settings.listen_endpoints()?).await?;
    let local_addr = endpoint.local_addr()?;
    let server_id = format!("{}:{}", local_hostname(), local_addr.port());

    // The local node sits in the peer table as the sentinel entry with no
    // address; peer entries that point back at this node are dropped.
    let mut peers = vec![Peer::local(server_id.clone())];
    for (host, port) in settings.peer_endpoints()? {
      if is_local_peer(&host, port, local_addr.port()) {
        debug!("[Raft] skipping own peer entry '{} {}'", host, port);
        continue;
      }
      peers.push(Peer::remote(resolve_peer(&host, port)?));
    }

    let rpc_loop = RpcLoop::new(
      endpoint,
      settings.max_rpc_payload_size,
      Box::new(NullCipher),
    );
    let (node, role_rx) = RaftNode::new(
      server_id,
      peers,
      settings.election_timeout_range(),
      settings.heartbeat_interval(),
      rpc_loop.peer(),
    );
    Ok(ClusterNode {
      rpc_loop,
      core: RaftCore {
        node,
        registry: RaftNode::registry(),
      },
      role_rx,
      local_addr,
    })
  }

  /// The primary socket's bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn server_id(&self) -> &str {
    self.core.node.server_id()
  }

  /// Enters the follower state and spawns the RPC main loop. The returned
  /// handle is the only way to reach the running node.
  pub fn start(mut self) -> NodeHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let peer = self.rpc_loop.peer();
    let role_rx = self.role_rx.clone();
    let local_addr = self.local_addr;
    let task = tokio::spawn(async move {
      self.core.node.enter_follower();
      self.rpc_loop.mainloop(&mut self.core, shutdown_rx).await;
    });
    NodeHandle {
      peer,
      role_rx,
      local_addr,
      shutdown: shutdown_tx,
      task,
    }
  }
}

/// Handle onto a running node.
pub struct NodeHandle {
  peer: RpcPeer,
  role_rx: RoleStateReceiver,
  local_addr: SocketAddr,
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

impl NodeHandle {
  /// The RPC runtime handle, for issuing `call`/`acall` against peers.
  pub fn peer(&self) -> RpcPeer {
    self.peer.clone()
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn role_state(&self) -> RoleState {
    self.role_rx.borrow().clone()
  }

  /// A stream of role transitions, starting with the current state.
  pub fn subscribe_role(&self) -> WatchStream<RoleState> {
    WatchStream::new(self.role_rx.clone())
  }

  /// Stops the main loop: outstanding calls are cancelled, timers stopped
  /// and the sockets released.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    let _ = self.task.await;
  }
}

fn local_hostname() -> String {
  hostname::get()
    .ok()
    .and_then(|name| name.into_string().ok())
    .unwrap_or_else(|| "localhost".to_string())
}

/// A peer entry names this node when its address is loopback and its port is
/// the primary socket's port.
fn is_local_peer(host: &str, port: u16, primary_port: u16) -> bool {
  if port != primary_port {
    return false;
  }
  if host == "localhost" {
    return true;
  }
  host
    .parse::<IpAddr>()
    .map(|ip| ip.is_loopback())
    .unwrap_or(false)
}

fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr, NodeError> {
  let address = (host, port)
    .to_socket_addrs()
    .map_err(NodeError::Io)?
    .next()
    .ok_or_else(|| anyhow!("cannot resolve peer address '{} {}'", host, port))?;
  Ok(address)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::raft::Role;

  #[test]
  fn loopback_entries_on_the_primary_port_are_local() {
    assert!(is_local_peer("localhost", 1711, 1711));
    assert!(is_local_peer("127.0.0.1", 1711, 1711));
    assert!(is_local_peer("127.0.0.7", 1711, 1711));
    assert!(is_local_peer("::1", 1711, 1711));

    assert!(!is_local_peer("127.0.0.1", 1712, 1711));
    assert!(!is_local_peer("10.0.0.1", 1711, 1711));
    assert!(!is_local_peer("example.com", 1711, 1711));
  }

  #[tokio::test]
  async fn own_peer_entries_are_filtered_out() {
    // Listen on a known port so the peers list can name it.
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let settings = RaftSettings {
      listen: format!("127.0.0.1 {}", port),
      peers: format!("localhost {}\n127.0.0.1 19\n", port),
      ..Default::default()
    };
    let node = ClusterNode::new(settings).await.unwrap();
    let peers = node.core.node.peers();
    // Sentinel local peer plus the one genuine remote.
    assert_eq!(peers.len(), 2);
    assert!(peers[0].address.is_none());
    assert_eq!(peers[1].address, Some("127.0.0.1:19".parse().unwrap()));
  }

  #[tokio::test]
  async fn server_id_carries_the_primary_port() {
    let node = ClusterNode::new(RaftSettings::default()).await.unwrap();
    let expected = format!(":{}", node.local_addr().port());
    assert!(node.server_id().ends_with(&expected));
    assert_eq!(node.role_rx.borrow().role, Role::Unknown);
  }

  #[tokio::test]
  async fn validation_failures_surface_as_config_errors() {
    let settings = RaftSettings {
      election_timeout_min: 300,
      election_timeout_max: 200,
      ..Default::default()
    };
    assert!(matches!(
      ClusterNode::new(settings).await,
      Err(NodeError::Config(_))
    ));
  }
}
