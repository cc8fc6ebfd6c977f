use futures::future::select_all;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error};

/// The bound UDP sockets of a node.
///
/// The first bound socket is the **primary socket**: every outbound datagram
/// leaves through it. Any additional sockets are receive-only listeners.
#[derive(Debug)]
pub struct Endpoint {
  sockets: Vec<Arc<UdpSocket>>,
}

impl Endpoint {
  /// Binds one socket per `(address, port)` pair, in order. At least one
  /// pair is required.
  pub async fn bind(listen: &[(String, u16)]) -> io::Result<Self> {
    if listen.is_empty() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "no listen endpoint configured",
      ));
    }
    let mut sockets = Vec::with_capacity(listen.len());
    for (addr, port) in listen {
      let socket = UdpSocket::bind((addr.as_str(), *port)).await?;
      debug!("[RPC] listening on {}", socket.local_addr()?);
      sockets.push(Arc::new(socket));
    }
    Ok(Endpoint { sockets })
  }

  pub fn primary(&self) -> Arc<UdpSocket> {
    self.sockets[0].clone()
  }

  /// The primary socket's bound address.
  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.sockets[0].local_addr()
  }

  /// Waits until any socket is read-ready and returns its index.
  pub async fn readable(&self) -> io::Result<usize> {
    let readiness = self.sockets.iter().map(|s| s.readable().boxed());
    let (result, index, _) = select_all(readiness).await;
    result.map(|_| index)
  }

  /// Drains every pending datagram from the socket at `index`, handing each
  /// `(bytes, peer address)` pair to `sink`, until the socket would block.
  pub fn drain(&self, index: usize, buf: &mut [u8], mut sink: impl FnMut(&[u8], SocketAddr)) {
    let socket = &self.sockets[index];
    loop {
      match socket.try_recv_from(buf) {
        Ok((len, peer_addr)) => sink(&buf[..len], peer_addr),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) => {
          error!("[RPC] recv error: {}", err);
          break;
        },
      }
    }
  }
}
