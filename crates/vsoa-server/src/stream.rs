//! Stream tunnels: a secondary TCP connection associated with a `tunid`, used for bulk data that
//! doesn't fit the request/reply frame model (e.g. file transfer, video). Grounded on
//! `vsoa_server_stream_t`: the main channel negotiates a tunnel id and port, the peer opens a
//! second TCP connection to that port, and bytes flow on it outside the frame codec entirely.

use mio::net::{TcpListener, TcpStream};
use hashbrown::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use vsoa_support::error::{VsoaError, VsoaErrorKind, VsoaResult};

pub type TunnelId = u16;

enum TunnelState {
    /// Listening for the peer's secondary connection, since `opened_at`.
    Awaiting { listener: TcpListener, opened_at: Instant },
    Open { stream: TcpStream },
}

pub struct Tunnel {
    pub id: TunnelId,
    pub owner: crate::client::ClientId,
    state: TunnelState,
}

impl Tunnel {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.state {
            TunnelState::Awaiting { listener, .. } => listener.local_addr(),
            TunnelState::Open { stream } => stream.local_addr(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TunnelState::Open { .. })
    }
}
/// Registry of in-flight stream tunnels for one server.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: HashMap<TunnelId, Tunnel>,
    next_id: u16,
}

impl TunnelRegistry {
    pub fn new() -> TunnelRegistry {
        TunnelRegistry { tunnels: HashMap::new(), next_id: 1 }
    }

    /// Opens a listener on `bind_addr` (typically `0.0.0.0:0` for an ephemeral port) for a new
    /// tunnel owned by `owner`, returning the assigned tunnel id and the port the peer should
    /// connect to.
    pub fn create(&mut self, owner: crate::client::ClientId, bind_addr: &str) -> VsoaResult<(TunnelId, SocketAddr)> {
        let addr: SocketAddr = bind_addr.parse()?;
        let listener = TcpListener::bind(&addr).map_err(VsoaError::from)?;
        let local_addr = listener.local_addr().map_err(VsoaError::from)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        self.tunnels.insert(
            id,
            Tunnel { id, owner, state: TunnelState::Awaiting { listener, opened_at: Instant::now() } },
        );
        Ok((id, local_addr))
    }

    /// Polls every still-awaiting tunnel for an incoming connection, promoting it to `Open` on
    /// success. Returns the ids that transitioned this call.
    pub fn accept_pending(&mut self) -> Vec<TunnelId> {
        let mut opened = Vec::new();
        for (id, tunnel) in self.tunnels.iter_mut() {
            if let TunnelState::Awaiting { listener, .. } = &tunnel.state {
                match listener.accept() {
                    Ok((stream, _)) => {
                        tunnel.state = TunnelState::Open { stream };
                        opened.push(*id);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => {} // leave awaiting; handshake_timeout sweep below will reap it
                }
            }
        }
        opened
    }

    /// Drops any tunnel still awaiting its peer connection past `timeout`, returning their ids.
    pub fn reap_expired(&mut self, timeout: std::time::Duration) -> Vec<TunnelId> {
        let expired: Vec<TunnelId> = self
            .tunnels
            .iter()
            .filter_map(|(id, t)| match &t.state {
                TunnelState::Awaiting { opened_at, .. } if opened_at.elapsed() >= timeout => Some(*id),
                _ => None,
            })
            .collect();
        for id in &expired {
            self.tunnels.remove(id);
        }
        expired
    }

    pub fn get_mut(&mut self, id: TunnelId) -> Option<&mut Tunnel> {
        self.tunnels.get_mut(&id)
    }

    pub fn is_open(&self, id: TunnelId) -> bool {
        self.tunnels.get(&id).map_or(false, Tunnel::is_open)
    }

    /// Removes `id` and returns its raw socket, if it's open. The tunnel is no longer tracked by
    /// the registry once taken; the caller owns the socket's lifetime from here.
    pub fn take_open(&mut self, id: TunnelId) -> Option<TcpStream> {
        match self.tunnels.get(&id) {
            Some(t) if t.is_open() => match self.tunnels.remove(&id).unwrap().state {
                TunnelState::Open { stream } => Some(stream),
                TunnelState::Awaiting { .. } => unreachable!("checked is_open above"),
            },
            _ => None,
        }
    }

    pub fn close(&mut self, id: TunnelId) -> bool {
        self.tunnels.remove(&id).is_some()
    }

    /// Closes every tunnel owned by `owner` (used when the owning client disconnects).
    pub fn close_owned_by(&mut self, owner: crate::client::ClientId) {
        self.tunnels.retain(|_, t| t.owner != owner);
    }

    pub fn lookup_error() -> VsoaError {
        VsoaError::Fatal(VsoaErrorKind::NoSuchSlot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_increasing_ids() {
        let mut reg = TunnelRegistry::new();
        let (id1, addr1) = reg.create(0, "127.0.0.1:0").unwrap();
        let (id2, _addr2) = reg.create(0, "127.0.0.1:0").unwrap();
        assert_ne!(id1, id2);
        assert!(addr1.port() > 0);
    }

    #[test]
    fn accept_pending_promotes_to_open_once_peer_connects() {
        let mut reg = TunnelRegistry::new();
        let (id, addr) = reg.create(0, "127.0.0.1:0").unwrap();
        assert!(!reg.is_open(id));
        assert!(reg.accept_pending().is_empty());

        let _peer = std::net::TcpStream::connect(addr).unwrap();
        // mio's non-blocking accept may need a moment to see the connection.
        let mut opened = Vec::new();
        for _ in 0..50 {
            opened = reg.accept_pending();
            if !opened.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(opened, vec![id]);
        assert!(reg.is_open(id));
    }

    #[test]
    fn take_open_removes_the_tunnel_and_hands_over_the_socket() {
        let mut reg = TunnelRegistry::new();
        let (id, addr) = reg.create(0, "127.0.0.1:0").unwrap();
        assert!(reg.take_open(id).is_none(), "not open yet");

        let _peer = std::net::TcpStream::connect(addr).unwrap();
        let mut opened = Vec::new();
        for _ in 0..50 {
            opened = reg.accept_pending();
            if !opened.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(opened, vec![id]);

        assert!(reg.take_open(id).is_some());
        assert!(reg.get_mut(id).is_none());
    }

    #[test]
    fn close_owned_by_removes_only_that_owners_tunnels() {
        let mut reg = TunnelRegistry::new();
        let (id_a, _) = reg.create(1, "127.0.0.1:0").unwrap();
        let (id_b, _) = reg.create(2, "127.0.0.1:0").unwrap();
        reg.close_owned_by(1);
        assert!(reg.get_mut(id_a).is_none());
        assert!(reg.get_mut(id_b).is_some());
    }
}
