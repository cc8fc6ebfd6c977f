#![allow(dead_code)]

use conclave_node::config::RaftSettings;
use conclave_node::node::{ClusterNode, NodeHandle};
use conclave_node::raft::{Role, RoleState};
use std::sync::Once;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub fn setup_log() {
  static START: Once = Once::new();
  START.call_once(|| {
    let level = "trace";
    let mut filters = vec![];
    filters.push(format!("conclave_rpc={}", level));
    filters.push(format!("conclave_node={}", level));
    std::env::set_var("RUST_LOG", filters.join(","));

    let subscriber = Subscriber::builder()
      .with_env_filter(EnvFilter::from_default_env())
      .with_line_number(true)
      .with_ansi(true)
      .finish();
    subscriber.try_init().unwrap();
  });
}

/// Grabs `count` distinct free UDP ports on the loopback interface.
pub fn free_ports(count: usize) -> Vec<u16> {
  let sockets: Vec<std::net::UdpSocket> = (0..count)
    .map(|_| std::net::UdpSocket::bind("127.0.0.1:0").unwrap())
    .collect();
  sockets
    .iter()
    .map(|socket| socket.local_addr().unwrap().port())
    .collect()
}

/// Symmetric cluster configuration: every node lists every port (its own
/// included; the node filters itself out).
pub fn cluster_settings(ports: &[u16], index: usize) -> RaftSettings {
  let peers = ports
    .iter()
    .map(|port| format!("127.0.0.1 {}", port))
    .collect::<Vec<_>>()
    .join("\n");
  RaftSettings {
    listen: format!("127.0.0.1 {}", ports[index]),
    peers,
    max_rpc_payload_size: 8192,
    election_timeout_min: 150,
    election_timeout_max: 300,
    heartbeat_timeout: 50,
  }
}

pub async fn start_node(settings: RaftSettings) -> NodeHandle {
  ClusterNode::new(settings).await.unwrap().start()
}

/// Waits until the node reports `role`, panicking after `within`.
pub async fn wait_for_role(handle: &NodeHandle, role: Role, within: Duration) -> RoleState {
  let mut stream = handle.subscribe_role();
  let reached = async {
    while let Some(state) = stream.next().await {
      if state.role == role {
        return state;
      }
    }
    panic!("role stream ended before reaching {:?}", role);
  };
  match tokio::time::timeout(within, reached).await {
    Ok(state) => state,
    Err(_) => panic!("node did not reach {:?} within {:?}", role, within),
  }
}
