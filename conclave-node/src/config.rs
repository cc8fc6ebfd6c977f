use serde::Deserialize;
use std::time::Duration;

/// Settings of a cluster node, typically read from the `asab:raft` section
/// of the hosting process configuration.
///
/// `listen` and `peers` are newline-separated lists of `"<address> <port>"`
/// entries. The local node may appear in `peers`; it is detected and
/// filtered out at construction time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
  pub listen: String,
  pub peers: String,
  /// Receive ceiling in bytes; larger datagrams are dropped.
  pub max_rpc_payload_size: usize,
  /// Election timer draw range, milliseconds.
  pub election_timeout_min: u64,
  pub election_timeout_max: u64,
  /// Heartbeat cadence, milliseconds.
  pub heartbeat_timeout: u64,
}

impl Default for RaftSettings {
  fn default() -> Self {
    RaftSettings {
      listen: "127.0.0.1 0".to_string(),
      peers: String::new(),
      max_rpc_payload_size: 8192,
      election_timeout_min: 150,
      election_timeout_max: 300,
      heartbeat_timeout: 50,
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("no listen endpoint configured")]
  NoListenEndpoint,

  #[error("invalid endpoint entry '{0}', expected '<address> <port>'")]
  InvalidEndpoint(String),

  #[error("election timeout range [{min}, {max}) is empty")]
  EmptyElectionRange { min: u64, max: u64 },
}

impl RaftSettings {
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.election_timeout_min >= self.election_timeout_max {
      return Err(ConfigError::EmptyElectionRange {
        min: self.election_timeout_min,
        max: self.election_timeout_max,
      });
    }
    self.listen_endpoints().map(|_| ())
  }

  /// The listener list; at least one entry is required.
  pub fn listen_endpoints(&self) -> Result<Vec<(String, u16)>, ConfigError> {
    let endpoints = parse_endpoints(&self.listen)?;
    if endpoints.is_empty() {
      return Err(ConfigError::NoListenEndpoint);
    }
    Ok(endpoints)
  }

  /// The configured peer list; may be empty and may include the local node.
  pub fn peer_endpoints(&self) -> Result<Vec<(String, u16)>, ConfigError> {
    parse_endpoints(&self.peers)
  }

  pub fn election_timeout_range(&self) -> (u64, u64) {
    (self.election_timeout_min, self.election_timeout_max)
  }

  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_millis(self.heartbeat_timeout)
  }
}

/// Parses a newline-separated list of `"<address> <port>"` entries. Blank
/// lines are skipped; everything after the first space is the port.
fn parse_endpoints(raw: &str) -> Result<Vec<(String, u16)>, ConfigError> {
  let mut endpoints = Vec::new();
  for line in raw.lines() {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    let (addr, port) = line
      .split_once(' ')
      .ok_or_else(|| ConfigError::InvalidEndpoint(line.to_string()))?;
    let port = port
      .trim()
      .parse::<u16>()
      .map_err(|_| ConfigError::InvalidEndpoint(line.to_string()))?;
    endpoints.push((addr.trim().to_string(), port));
  }
  Ok(endpoints)
}
