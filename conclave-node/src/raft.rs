use conclave_rpc::core::registry::MethodRegistry;
use conclave_rpc::core::rpc_peer::{RpcPeer, TimerToken};
use conclave_rpc::error::RpcError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const ELECTION_TIMER: TimerToken = TimerToken(0);
pub const HEARTBEAT_TIMER: TimerToken = TimerToken(1);

pub const APPEND_ENTRIES_METHOD: &str = "AppendEntries";
pub const REQUEST_VOTE_METHOD: &str = "RequestVote";

const UNKNOWN_SERVER_ID: &str = "?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Only observed between construction and the first transition to
  /// follower.
  Unknown,
  Follower,
  Candidate,
  Leader,
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Role::Unknown => write!(f, "unknown"),
      Role::Follower => write!(f, "follower"),
      Role::Candidate => write!(f, "candidate"),
      Role::Leader => write!(f, "leader"),
    }
  }
}

/// The role and term a node currently holds, broadcast on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleState {
  pub role: Role,
  pub term: u64,
}

pub type RoleStateSender = watch::Sender<RoleState>;
pub type RoleStateReceiver = watch::Receiver<RoleState>;

/// A member of the consensus cluster. The local node sits in the peer table
/// as the entry with no address.
#[derive(Debug, Clone)]
pub struct Peer {
  pub address: Option<SocketAddr>,
  /// Learned from the first reply; `"?"` until then.
  pub server_id: String,
  /// Valid for the election in progress only.
  pub vote_granted: bool,
}

impl Peer {
  pub fn remote(address: SocketAddr) -> Self {
    Peer {
      address: Some(address),
      server_id: UNKNOWN_SERVER_ID.to_string(),
      vote_granted: false,
    }
  }

  pub fn local(server_id: String) -> Self {
    Peer {
      address: None,
      server_id,
      vote_granted: false,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
  pub term: u64,
  pub payload: JsonValue,
}

/// State that survives restarts in a full implementation; held in memory
/// here. `current_term` never decreases.
#[derive(Debug, Default)]
pub struct PersistentState {
  pub current_term: u64,
  pub voted_for: Option<String>,
  pub log: Vec<LogEntry>,
}

#[derive(Debug, Default)]
pub struct VolatileState {
  pub commit_index: u64,
  pub last_applied: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendEntriesParams {
  term: u64,
  #[allow(dead_code)]
  leader_id: String,
  #[serde(default)]
  #[allow(dead_code)]
  prev_log_index: u64,
  #[serde(default)]
  #[allow(dead_code)]
  prev_log_term: u64,
  #[serde(default)]
  #[allow(dead_code)]
  entries: Vec<LogEntry>,
  #[serde(default)]
  #[allow(dead_code)]
  leader_commit_index: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendEntriesReply {
  term: u64,
  success: bool,
  server_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestVoteParams {
  term: u64,
  candidate_id: String,
  #[serde(default)]
  #[allow(dead_code)]
  last_log_index: u64,
  #[serde(default)]
  #[allow(dead_code)]
  last_log_term: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestVoteReply {
  term: u64,
  vote_granted: bool,
  server_id: String,
}

/// The Raft role machine: owns the role, the term, the vote record and the
/// peer table, and drives elections and heartbeats through the RPC runtime.
///
/// Every method runs on the RPC loop task; nothing here suspends.
pub struct RaftNode {
  server_id: String,
  role: Role,
  peers: Vec<Peer>,
  persistent: PersistentState,
  volatile: VolatileState,
  election_timeout: (u64, u64),
  heartbeat_timeout: Duration,
  rpc: RpcPeer,
  role_tx: RoleStateSender,
}

impl RaftNode {
  pub fn new(
    server_id: String,
    peers: Vec<Peer>,
    election_timeout: (u64, u64),
    heartbeat_timeout: Duration,
    rpc: RpcPeer,
  ) -> (Self, RoleStateReceiver) {
    let (role_tx, role_rx) = watch::channel(RoleState {
      role: Role::Unknown,
      term: 0,
    });
    let node = RaftNode {
      server_id,
      role: Role::Unknown,
      peers,
      persistent: PersistentState::default(),
      volatile: VolatileState::default(),
      election_timeout,
      heartbeat_timeout,
      rpc,
      role_tx,
    };
    (node, role_rx)
  }

  /// Binds the Raft method surface against the RPC runtime: inbound request
  /// handlers plus the handlers observing replies to our own calls.
  pub fn registry() -> MethodRegistry<RaftNode> {
    MethodRegistry::new()
      .request(APPEND_ENTRIES_METHOD, Self::on_append_entries)
      .request(REQUEST_VOTE_METHOD, Self::on_request_vote)
      .reply(APPEND_ENTRIES_METHOD, Self::on_append_entries_reply)
      .reply(REQUEST_VOTE_METHOD, Self::on_request_vote_reply)
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn current_term(&self) -> u64 {
    self.persistent.current_term
  }

  pub fn server_id(&self) -> &str {
    &self.server_id
  }

  pub fn peers(&self) -> &[Peer] {
    &self.peers
  }

  fn publish_role(&self) {
    let _ = self.role_tx.send(RoleState {
      role: self.role,
      term: self.persistent.current_term,
    });
  }

  fn draw_election_timeout(&self) -> Duration {
    let (min, max) = self.election_timeout;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
  }

  pub fn enter_follower(&mut self) {
    info!("[Raft] entering follower state from '{}'", self.role);
    self.role = Role::Follower;
    self.rpc.cancel_timer(HEARTBEAT_TIMER);
    self.rpc.schedule_timer(ELECTION_TIMER, self.draw_election_timeout());
    self.publish_role();
  }

  fn enter_candidate(&mut self) {
    self.persistent.current_term += 1;
    info!(
      "[Raft] entering candidate state from '{}', term {}",
      self.role, self.persistent.current_term
    );
    self.role = Role::Candidate;
    self.publish_role();

    for index in 0..self.peers.len() {
      if self.peers[index].address.is_some() {
        self.peers[index].vote_granted = false;
        self.request_vote(index);
      } else {
        self.peers[index].vote_granted = true;
      }
    }

    self.evaluate_election();
    if self.role == Role::Candidate {
      self.rpc.schedule_timer(ELECTION_TIMER, self.draw_election_timeout());
      self.rpc.schedule_timer(HEARTBEAT_TIMER, self.heartbeat_timeout);
    }
  }

  fn enter_leader(&mut self) {
    info!(
      "[Raft] entering leader state from '{}', term {}",
      self.role, self.persistent.current_term
    );
    self.role = Role::Leader;
    self.rpc.cancel_timer(ELECTION_TIMER);
    self.rpc.schedule_timer(HEARTBEAT_TIMER, self.heartbeat_timeout);
    self.publish_role();
    self.send_heartbeat();
  }

  /// A candidate wins once the granted votes outnumber the rest of the peer
  /// table, the local node included.
  fn evaluate_election(&mut self) {
    if self.role != Role::Candidate {
      debug!("[Raft] vote tally ignored in '{}' state", self.role);
      return;
    }
    let voted_yes = self.peers.iter().filter(|p| p.vote_granted).count();
    let voted_no = self.peers.len() - voted_yes;
    if voted_yes > voted_no {
      self.enter_leader();
    }
  }

  pub(crate) fn on_election_timeout(&mut self) {
    self.enter_candidate();
  }

  pub(crate) fn on_heartbeat_timeout(&mut self) {
    match self.role {
      Role::Leader => self.send_heartbeat(),
      Role::Candidate => {
        // Re-solicit the peers that have not granted their vote yet.
        for index in 0..self.peers.len() {
          if self.peers[index].address.is_some() && !self.peers[index].vote_granted {
            self.request_vote(index);
          }
        }
      },
      state => warn!("[Raft] no heartbeat needed for a '{}' state", state),
    }
    self.rpc.schedule_timer(HEARTBEAT_TIMER, self.heartbeat_timeout);
  }

  fn send_heartbeat(&self) {
    for index in 0..self.peers.len() {
      if self.peers[index].address.is_some() {
        self.append_entries(index);
      }
    }
  }

  fn append_entries(&self, peer_index: usize) {
    debug_assert_eq!(self.role, Role::Leader);
    let Some(address) = self.peers[peer_index].address else {
      return;
    };
    // TODO: fill prevLogIndex/prevLogTerm from the log once replication
    // carries real entries.
    self.rpc.call(
      address,
      APPEND_ENTRIES_METHOD,
      json!({
        "term": self.persistent.current_term,
        "leaderId": self.server_id,
        "prevLogIndex": 1,
        "prevLogTerm": 1,
        "entries": [],
        "leaderCommitIndex": self.volatile.commit_index,
      }),
    );
  }

  fn request_vote(&self, peer_index: usize) {
    let Some(address) = self.peers[peer_index].address else {
      return;
    };
    self.rpc.call(
      address,
      REQUEST_VOTE_METHOD,
      json!({
        "term": self.persistent.current_term,
        "candidateId": self.server_id,
        "lastLogIndex": 1,
        "lastLogTerm": 1,
      }),
    );
  }

  /// Inbound `AppendEntries`. A stale term is refused; a current or newer
  /// term is adopted, demotes a non-follower and pushes the election timer
  /// back.
  fn on_append_entries(
    &mut self,
    _peer: SocketAddr,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    let request: AppendEntriesParams = serde_json::from_value(params)?;
    let mut reply = AppendEntriesReply {
      term: self.persistent.current_term,
      success: false,
      server_id: self.server_id.clone(),
    };

    if request.term < self.persistent.current_term {
      warn!(
        "[Raft] received AppendEntries for an old term {} when current term is {}",
        request.term, self.persistent.current_term
      );
      return Ok(serde_json::to_value(reply)?);
    }
    // The vote record is kept across the term bump.
    self.persistent.current_term = request.term;

    if self.role != Role::Follower {
      self.enter_follower();
    }
    self.rpc.schedule_timer(ELECTION_TIMER, self.draw_election_timeout());

    reply.success = true;
    Ok(serde_json::to_value(reply)?)
  }

  /// Inbound `RequestVote`. The vote goes to the first candidate asking in
  /// a term, and stays with it; the reply echoes the candidate's term.
  fn on_request_vote(
    &mut self,
    _peer: SocketAddr,
    params: JsonValue,
  ) -> Result<JsonValue, RpcError> {
    let request: RequestVoteParams = serde_json::from_value(params)?;
    let mut reply = RequestVoteReply {
      term: request.term,
      vote_granted: false,
      server_id: self.server_id.clone(),
    };

    if request.term < self.persistent.current_term {
      return Ok(serde_json::to_value(reply)?);
    }
    if let Some(voted_for) = &self.persistent.voted_for {
      if voted_for != &request.candidate_id {
        return Ok(serde_json::to_value(reply)?);
      }
    }

    self.persistent.voted_for = Some(request.candidate_id.clone());
    reply.vote_granted = true;
    info!("[Raft] voted for '{}'", request.candidate_id);

    if self.role == Role::Candidate {
      self.enter_follower();
    }
    Ok(serde_json::to_value(reply)?)
  }

  /// A reply to one of our `AppendEntries` calls; only used to learn the
  /// peer's server id.
  fn on_append_entries_reply(&mut self, peer: SocketAddr, result: JsonValue) {
    let reply: AppendEntriesReply = match serde_json::from_value(result) {
      Ok(reply) => reply,
      Err(err) => {
        warn!("[Raft] malformed AppendEntries reply from {}: {}", peer, err);
        return;
      },
    };
    self.learn_peer_id(peer, &reply.server_id);
  }

  /// A reply to one of our `RequestVote` calls. A granted vote flips the
  /// peer's flag once and re-evaluates the election.
  fn on_request_vote_reply(&mut self, peer: SocketAddr, result: JsonValue) {
    let reply: RequestVoteReply = match serde_json::from_value(result) {
      Ok(reply) => reply,
      Err(err) => {
        warn!("[Raft] malformed RequestVote reply from {}: {}", peer, err);
        return;
      },
    };

    if reply.term < self.persistent.current_term {
      return;
    }
    if reply.term > self.persistent.current_term {
      warn!(
        "[Raft] received RequestVote reply for term {} higher than current term {}",
        reply.term, self.persistent.current_term
      );
      return;
    }

    let Some(index) = self.learn_peer_id(peer, &reply.server_id) else {
      return;
    };
    if reply.vote_granted {
      if !self.peers[index].vote_granted {
        self.peers[index].vote_granted = true;
        self.evaluate_election();
      } else {
        warn!(
          "[Raft] peer '{}' / '{}' already voted",
          peer, reply.server_id
        );
      }
    }
  }

  /// Finds the peer record for `address` and records the server id carried
  /// by a reply. Returns the peer's index, or `None` for an address outside
  /// the peer table.
  fn learn_peer_id(&mut self, address: SocketAddr, server_id: &str) -> Option<usize> {
    let index = self
      .peers
      .iter()
      .position(|peer| peer.address == Some(address));
    match index {
      Some(index) => {
        let peer = &mut self.peers[index];
        if peer.server_id == UNKNOWN_SERVER_ID {
          info!("[Raft] peer at {} is now known as '{}'", address, server_id);
          peer.server_id = server_id.to_string();
        } else if peer.server_id != server_id {
          warn!(
            "[Raft] server id changed from '{}' to '{}' at {}",
            peer.server_id, server_id, address
          );
          peer.server_id = server_id.to_string();
        }
        Some(index)
      },
      None => {
        warn!("[Raft] cannot find peer entry for {} / '{}'", address, server_id);
        None
      },
    }
  }
}
