use mio::net::TcpStream;
use std::net::SocketAddr;
use std::time::Instant;
use vsoa_codec::Recv;

pub type ClientId = u32;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClientState {
    /// Accepted, waiting for the `SERVINFO` handshake to complete within the handshake timeout.
    Handshake,
    Connected,
}

/// Per-connection state. Held in the server's client table, indexed by a free-list slot that
/// becomes this client's `ClientId`.
pub struct Client {
    pub id: ClientId,
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub token: mio::Token,
    pub state: ClientState,
    pub authed: bool,
    pub priority: u8,
    pub send_timeout_ms: u64,
    pub keepalive_secs: Option<u32>,
    pub linger_secs: Option<i32>,
    pub opened_at: Instant,
    pub last_activity: Instant,
    pub recv: Recv,
    pub custom: Option<Box<dyn std::any::Any + Send>>,
}

impl Client {
    pub fn new(id: ClientId, stream: TcpStream, addr: SocketAddr, token: mio::Token) -> Client {
        let now = Instant::now();
        Client {
            id,
            stream,
            addr,
            token,
            state: ClientState::Handshake,
            authed: true,
            priority: 0,
            send_timeout_ms: super::config::DEF_SEND_TIMEOUT_MS,
            keepalive_secs: None,
            linger_secs: None,
            opened_at: now,
            last_activity: now,
            recv: Recv::new(),
            custom: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn handshake_elapsed(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    pub fn idle_elapsed(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }
}

/// Free-list-backed client table: ids are slot indices, reused once a slot is freed (see
/// `SPEC_FULL.md`'s decision on client id reuse in `DESIGN.md`).
pub struct ClientTable {
    slots: Vec<Option<Client>>,
    free: Vec<usize>,
}

impl ClientTable {
    pub fn new() -> ClientTable {
        ClientTable { slots: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, make: impl FnOnce(ClientId) -> Client) -> ClientId {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let client = make(idx as ClientId);
        self.slots[idx] = Some(client);
        idx as ClientId
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let idx = id as usize;
        let client = self.slots.get_mut(idx).and_then(Option::take);
        if client.is_some() {
            self.free.push(idx);
        }
        client
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.iter().map(|c| c.id).collect()
    }

    pub fn count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Default for ClientTable {
    fn default() -> ClientTable {
        ClientTable::new()
    }
}
