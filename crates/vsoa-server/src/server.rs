//! Accept loop, handshake state machine, subscription fan-out and RPC dispatch. Grounded on
//! `vsoa_server.h` plus the three-pass `mio::Poll` dispatcher shape of
//! `neutronium::net::Endpoint::sync` (listen poll, handshake poll, live poll, all non-blocking,
//! run once per tick from a single owning thread).

use hashbrown::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use slog::Logger;
use socket2::{Domain, Socket, Type};

use vsoa_codec::{status, FrameHeader, FrameType, Flags};
use vsoa_middleware::{ReplyPayload, ReplySink};
use vsoa_pool::Pool;
use vsoa_regulator::Regulator;
use vsoa_sender::{Sender, SockId, Socket as SenderSocket};
use vsoa_support::error::{ErrorUtils, VsoaError, VsoaErrorKind, VsoaResult};
use vsoa_trie::Trie;

use crate::client::{Client, ClientId, ClientState, ClientTable};
use crate::config::ServerConfig;
use crate::listener::{RpcListener, RpcRequest};
use crate::stream::TunnelRegistry;

const LISTEN_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Creates the listening socket the way `vsoa_server_start` does: SO_REUSEADDR, bind, listen with
/// `backlog`, non-blocking. `mio::net::TcpListener::bind` doesn't expose a backlog knob, so the
/// socket is built and configured with `socket2` then handed to mio via `from_std`.
fn bind_listener(addr: &SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Observable lifecycle events, drained by the embedding application after each `tick`.
pub enum ServerEvent {
    Connected(ClientId, SocketAddr),
    Disconnected(ClientId),
}

/// A clone of a client's non-blocking TCP stream, handed to the parallel sender so outbound
/// writes run on a dedicated thread instead of the dispatcher. Since the underlying socket stays
/// non-blocking, writes are retried until `timeout` elapses rather than relying on a kernel send
/// timeout.
struct ClientSocket(TcpStream);

impl SenderSocket for ClientSocket {
    fn write_frame(&mut self, buf: &[u8], timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;
        while offset < buf.len() {
            match self.0.write(&buf[offset..]) {
                Ok(n) => offset += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Backs `vsoa_mware_resolve_t::reply`: knows how to frame and enqueue a reply to one particular
/// client via the shared pool/sender.
struct ServerReplySink {
    shared: Arc<Shared>,
    client: ClientId,
    seqno: u32,
}

impl ReplySink for ServerReplySink {
    fn reply(&self, status: u8, tunid: u16, payload: ReplyPayload<'_>) {
        self.shared.send_reply(self.client, self.seqno, tunid, status, payload.param, payload.data);
    }
}

/// State shared between the dispatcher thread and plistener worker threads (via `ServerReplySink`
/// and RPC chain closures): the packet pool, parallel sender, and per-client send-socket handles.
struct Shared {
    pool: Pool,
    sender: Sender,
    sockets: Mutex<HashMap<ClientId, SockId>>,
    log: Logger,
}

impl Shared {
    fn send_reply(&self, client: ClientId, seqno: u32, tunid: u16, status: u8, param: &[u8], data: &[u8]) {
        self.send_frame(client, FrameType::Rpc, Flags::REPLY, status, seqno, tunid, b"", param, data);
    }

    #[allow(clippy::too_many_arguments)]
    fn send_frame(
        &self,
        client: ClientId,
        frame_type: FrameType,
        flags: Flags,
        status: u8,
        seqno: u32,
        tunid: u16,
        url: &[u8],
        param: &[u8],
        data: &[u8],
    ) {
        let sock = match self.sockets.lock().expect("socket table lock poisoned").get(&client).copied() {
            Some(sock) => sock,
            None => return, // client already gone
        };

        let (total, pad) = match vsoa_codec::header::calc_size(url.len(), param.len(), data.len(), vsoa_codec::MAX_PACKET_LENGTH) {
            Ok(v) => v,
            Err(_) => {
                slog::warn!(self.log, "dropping outbound frame, too large"; "client" => client);
                return;
            }
        };

        let mut buf = match self.pool.alloc(total) {
            Ok(buf) => buf,
            Err(_) => {
                slog::warn!(self.log, "packet pool exhausted, dropping outbound frame"; "client" => client);
                return;
            }
        };

        let mut header = FrameHeader::new(frame_type, flags, status, seqno);
        header.tunid = tunid;
        header.url_len = url.len() as u16;
        header.param_len = param.len() as u32;
        header.data_len = data.len() as u32;
        header.pad = pad;

        if let Some(out) = buf.payload_mut() {
            let _ = vsoa_codec::write_frame(&header, url, param, data, out);
        }

        let idx = self.sender.worker_for(sock);
        self.sender.write(idx, sock, buf);
    }
}

/// A single VSOA server: accept loop, handshake, subscription matching, and RPC dispatch.
pub struct Server {
    config: ServerConfig,
    listen: TcpListener,

    accept_poll: mio::Poll,
    handshake_poll: mio::Poll,
    live_poll: mio::Poll,
    events: mio::Events,

    clients: ClientTable,
    subs: Trie<ClientId>,
    rpc: Trie<Arc<RpcListener>>,
    tunnels: TunnelRegistry,
    regulator: Option<Regulator>,

    /// UDP quick channel, bound on demand by `enable_quick_channel`.
    quick: Option<std::net::UdpSocket>,
    /// Source address last observed for each client's quick-channel traffic, learned the first
    /// time that client sends a datagram on it; used to fan `quick_publish` back out.
    quick_addrs: HashMap<ClientId, SocketAddr>,
    on_datagram: Option<Arc<dyn Fn(ClientId, &[u8], &[u8], &[u8]) + Send + Sync>>,

    shared: Arc<Shared>,
    changes: Vec<ServerEvent>,
    log: Logger,
}

impl Server {
    pub fn new(config: ServerConfig) -> VsoaResult<Server> {
        let log = config.logging.build_logger();
        Server::with_logger(config, log)
    }

    pub fn with_logger(config: ServerConfig, log: Logger) -> VsoaResult<Server> {
        let addr: SocketAddr = config.listen_addr.parse()?;
        let listen = bind_listener(&addr, config.backlog)?;

        let accept_poll = mio::Poll::new()?;
        accept_poll.register(&listen, LISTEN_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let pool = Pool::new(config.pool_capacity, log.new(slog::o!("component" => "pool")));
        let sender = Sender::new(
            config.sender_workers,
            Duration::from_millis(config.send_timeout_ms),
            log.new(slog::o!("component" => "sender")),
        );

        Ok(Server {
            config,
            listen,
            accept_poll,
            handshake_poll: mio::Poll::new()?,
            live_poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            clients: ClientTable::new(),
            subs: Trie::new(),
            rpc: Trie::new(),
            tunnels: TunnelRegistry::new(),
            regulator: None,
            quick: None,
            quick_addrs: HashMap::new(),
            on_datagram: None,
            shared: Arc::new(Shared { pool, sender, sockets: Mutex::new(HashMap::new()), log: log.clone() }),
            changes: Vec::new(),
            log,
        })
    }

    /// Binds the UDP quick channel on the same address as the main listener. Clients learn the
    /// client id to tag quick frames with from the `SERVINFO` reply regardless of whether this
    /// is ever called; without it, incoming quick datagrams are simply never polled.
    pub fn enable_quick_channel(&mut self) -> VsoaResult<()> {
        let addr = self.listen.local_addr()?;
        let sock = std::net::UdpSocket::bind(addr)?;
        sock.set_nonblocking(true)?;
        self.quick = Some(sock);
        Ok(())
    }

    /// Registers the callback invoked for every `Datagram` frame received, whether over the
    /// reliable channel or the quick channel.
    pub fn on_datagram(&mut self, cb: impl Fn(ClientId, &[u8], &[u8], &[u8]) + Send + Sync + 'static) {
        self.on_datagram = Some(Arc::new(cb));
    }

    /// Installs a regulated-publish timer with the given coalescing period.
    pub fn enable_regulator(&mut self, period: Duration) {
        self.regulator = Some(Regulator::new(period, self.log.new(slog::o!("component" => "regulator"))));
    }

    /// Registers an RPC route. Fails with `DuplicateListener` if `pattern` already has a handler.
    pub fn add_rpc_listener(&mut self, pattern: &[u8]) -> VsoaResult<Arc<RpcListener>> {
        if self.rpc.has_pattern(pattern) {
            return Err(VsoaError::Fatal(VsoaErrorKind::DuplicateListener));
        }
        let listener = Arc::new(RpcListener::new(pattern));
        self.rpc.insert(pattern, listener.clone());
        Ok(listener)
    }

    pub fn remove_rpc_listener(&mut self, pattern: &[u8], listener: &Arc<RpcListener>) -> bool {
        self.rpc.remove(pattern, listener)
    }

    /// Forcibly closes one client's connection (`vsoa_server_cli_close`). No-op if `id` is
    /// already gone.
    pub fn cli_close(&mut self, id: ClientId) {
        self.disconnect(id);
    }

    /// Sets a client's QoS priority (`vsoa_server_cli_priority`), clamped to the documented
    /// `0..=5` range rather than accepting an arbitrary byte the way a `QOSSETUP` frame's raw
    /// status byte does.
    pub fn cli_priority(&mut self, id: ClientId, priority: u8) {
        if let Some(client) = self.clients.get_mut(id) {
            client.priority = priority.min(5);
        }
    }

    /// Overrides a client's keepalive timeout (`vsoa_server_cli_keepalive`), used by
    /// `housekeeping` in place of the server-wide default once set.
    pub fn cli_keepalive(&mut self, id: ClientId, seconds: u32) {
        if let Some(client) = self.clients.get_mut(id) {
            client.keepalive_secs = Some(seconds);
        }
    }

    /// Overrides a client's send timeout (`vsoa_server_cli_send_timeout`). Recorded per-client for
    /// callers that inspect it; the parallel sender itself still enforces one send timeout per
    /// `Server` (set at construction from `ServerConfig::send_timeout_ms`), since per-socket
    /// timeouts would require threading a timeout through every queued `Job`, not just the
    /// client table.
    pub fn cli_send_timeout(&mut self, id: ClientId, timeout: Duration) {
        if let Some(client) = self.clients.get_mut(id) {
            client.send_timeout_ms = timeout.as_millis() as u64;
        }
    }

    /// Marks a client authenticated or not (`vsoa_server_cli_set_authed`), for applications that
    /// layer their own auth RPC on top of the plain SERVINFO password check.
    pub fn cli_set_authed(&mut self, id: ClientId, authed: bool) {
        if let Some(client) = self.clients.get_mut(id) {
            client.authed = authed;
        }
    }

    /// Allocates a secondary listening TCP endpoint for a stream tunnel owned by `owner`
    /// (`vsoa_server_stream_create`). Returns the assigned `tunnel_id` and the address the peer
    /// should dial to complete the tunnel; the caller is responsible for getting that address to
    /// the peer (typically as the payload of the RPC reply that requested the tunnel).
    pub fn stream_create(&mut self, owner: ClientId, bind_addr: &str) -> VsoaResult<(crate::stream::TunnelId, SocketAddr)> {
        self.tunnels.create(owner, bind_addr)
    }

    /// Whether the peer has completed its secondary connection for `tunnel_id`
    /// (`vsoa_server_stream_accept`). Promotion from awaiting to open happens during `tick`; this
    /// just reports current state.
    pub fn stream_accept(&self, tunnel_id: crate::stream::TunnelId) -> bool {
        self.tunnels.is_open(tunnel_id)
    }

    /// Hands ownership of an opened tunnel's raw socket to the caller for its own I/O, removing
    /// it from the registry. Returns `None` if the tunnel doesn't exist or hasn't completed its
    /// peer handshake yet.
    pub fn stream_take(&mut self, tunnel_id: crate::stream::TunnelId) -> Option<mio::net::TcpStream> {
        self.tunnels.take_open(tunnel_id)
    }

    /// Tears down a tunnel, whether still awaiting its peer or already open
    /// (`vsoa_server_stream_close`). Returns `false` if `tunnel_id` is unknown.
    pub fn stream_close(&mut self, tunnel_id: crate::stream::TunnelId) -> bool {
        self.tunnels.close(tunnel_id)
    }

    /// Publishes `data` (with `param`) to every client subscribed at `url` or an ancestor prefix.
    /// Writes once into a pooled buffer and fans it out by reference (see `vsoa_pmem_t`).
    pub fn publish(&mut self, url: &[u8], param: &[u8], data: &[u8]) {
        let targets = self.subs.matches(url);
        if targets.is_empty() {
            return;
        }

        for client in targets {
            self.shared.send_frame(client, FrameType::Publish, Flags::empty(), status::SUCCESS, 0, 0, url, param, data);
        }
    }

    /// Publishes over the UDP quick channel instead of the reliable one, to every subscribed
    /// client whose quick address is already known. Silently drops targets that have never sent
    /// a quick frame (no address to reply to yet) rather than blocking on the reliable channel.
    pub fn quick_publish(&mut self, url: &[u8], param: &[u8], data: &[u8]) {
        let Some(sock) = &self.quick else { return };
        let (total, pad) = match vsoa_codec::header::calc_size(url.len(), param.len(), data.len(), vsoa_codec::MAX_QPACKET_LENGTH) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut header = FrameHeader::new(FrameType::Publish, Flags::empty(), status::SUCCESS, 0);
        header.url_len = url.len() as u16;
        header.param_len = param.len() as u32;
        header.data_len = data.len() as u32;
        header.pad = pad;
        let mut buf = vec![0u8; total];
        if vsoa_codec::write_frame(&header, url, param, data, &mut buf).is_err() {
            return;
        }

        for client in self.subs.matches(url) {
            if let Some(addr) = self.quick_addrs.get(&client) {
                let _ = sock.send_to(&buf, addr);
            }
        }
    }

    /// Sends a one-off datagram to a single client over the quick channel
    /// (`vsoa_server_cli_quick_datagram`). No-op if that client's quick address is unknown.
    pub fn quick_datagram(&mut self, client: ClientId, url: &[u8], param: &[u8], data: &[u8]) {
        let Some(sock) = &self.quick else { return };
        let Some(addr) = self.quick_addrs.get(&client) else { return };
        let (total, pad) = match vsoa_codec::header::calc_size(url.len(), param.len(), data.len(), vsoa_codec::MAX_QPACKET_LENGTH) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut header = FrameHeader::new(FrameType::Datagram, Flags::empty(), status::SUCCESS, 0);
        header.url_len = url.len() as u16;
        header.param_len = param.len() as u32;
        header.data_len = data.len() as u32;
        header.pad = pad;
        let mut buf = vec![0u8; total];
        if vsoa_codec::write_frame(&header, url, param, data, &mut buf).is_ok() {
            let _ = sock.send_to(&buf, addr);
        }
    }

    /// Drains whatever quick-channel datagrams have arrived since the last tick, without
    /// blocking. Each complete datagram is one frame; UDP never delivers a partial one.
    fn run_quick_pass(&mut self) {
        let Some(sock) = &self.quick else { return };
        let mut buf = [0u8; vsoa_codec::MAX_QPACKET_LENGTH];
        loop {
            let (n, from) = match sock.recv_from(&mut buf) {
                Ok(v) => v,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    slog::warn!(self.log, "quick channel recv failed"; "error" => %err);
                    return;
                }
            };

            let header = match FrameHeader::decode(&buf[..n]) {
                Ok(h) => h,
                Err(_) => continue,
            };
            if header.frame_type != FrameType::Datagram {
                continue;
            }
            let client = header.seqno as ClientId;
            self.quick_addrs.insert(client, from);

            let url_end = header.url_len as usize;
            let param_end = url_end + header.param_len as usize;
            let data_end = param_end + header.data_len as usize;
            let Some(payload) = buf.get(vsoa_codec::HEADER_SIZE..vsoa_codec::HEADER_SIZE + data_end) else { continue };
            if let Some(cb) = &self.on_datagram {
                cb(client, &payload[..url_end], &payload[url_end..param_end], &payload[param_end..data_end]);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listen.local_addr()
    }

    /// Drains lifecycle events accumulated since the last call.
    pub fn events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.changes)
    }

    /// Runs one non-blocking pass of accept, handshake and live polls, plus housekeeping. Intended
    /// to be called in a tight loop by the owning thread.
    pub fn tick(&mut self, now: Instant) {
        self.housekeeping(now);
        self.run_accept_pass();
        self.run_handshake_pass(now);
        self.run_live_pass(now);
        self.run_quick_pass();

        for sock in self.shared.sender.take_failures() {
            self.disconnect_by_sock(sock);
        }
    }

    fn run_accept_pass(&mut self) {
        self.accept_poll
            .poll(&mut self.events, Some(Duration::from_secs(0)))
            .expect("accept poll failed");

        let mut accepted = Vec::new();
        for event in self.events.iter() {
            if event.token() == LISTEN_TOKEN {
                loop {
                    match self.listen.accept() {
                        Ok((stream, addr)) => accepted.push((stream, addr)),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            slog::warn!(self.log, "accept failed"; "error" => %err);
                            break;
                        }
                    }
                }
            }
        }

        for (stream, addr) in accepted {
            if self.clients.count() >= self.config.max_clients {
                drop(stream);
                continue;
            }
            let id = self.clients.insert(|id| {
                let token = mio::Token(id as usize);
                Client::new(id, stream, addr, token)
            });
            let client = self.clients.get(id).expect("just inserted");
            if self
                .handshake_poll
                .register(&client.stream, client.token, mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge())
                .is_err()
            {
                self.clients.remove(id);
                continue;
            }

            if let Some(sock) = socket_sock_id(&client.stream) {
                if let Ok(clone) = client.stream.try_clone() {
                    self.shared.sender.register(sock, Box::new(ClientSocket(clone)));
                    self.shared.sockets.lock().expect("socket table lock poisoned").insert(id, sock);
                }
            }
        }
    }

    fn run_handshake_pass(&mut self, now: Instant) {
        self.handshake_poll
            .poll(&mut self.events, Some(Duration::from_secs(0)))
            .expect("handshake poll failed");

        let ready: Vec<mio::Token> = self.events.iter().map(|e| e.token()).collect();
        for token in ready {
            let id = token.0 as ClientId;
            if self.pump_client(id, now).is_err() {
                continue;
            }
            if let Some(client) = self.clients.get(id) {
                if client.state == ClientState::Connected {
                    let _ = self.handshake_poll.deregister(&client.stream);
                    let _ = self.live_poll.register(&client.stream, client.token, mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge());
                }
            }
        }
    }

    fn run_live_pass(&mut self, now: Instant) {
        self.live_poll
            .poll(&mut self.events, Some(Duration::from_secs(0)))
            .expect("live poll failed");

        let ready: Vec<mio::Token> = self.events.iter().map(|e| e.token()).collect();
        for token in ready {
            let id = token.0 as ClientId;
            let _ = self.pump_client(id, now);
        }
    }

    /// Reads and processes as many complete frames as are currently available for `id`.
    fn pump_client(&mut self, id: ClientId, now: Instant) -> VsoaResult<()> {
        let mut buf = [0u8; 65536];
        loop {
            let n = {
                let client = match self.clients.get_mut(id) {
                    Some(c) => c,
                    None => return Ok(()),
                };
                match client.stream.read(&mut buf) {
                    Ok(0) => {
                        self.disconnect(id);
                        return Ok(());
                    }
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(_) => {
                        self.disconnect(id);
                        return Ok(());
                    }
                }
            };

            {
                let client = self.clients.get_mut(id).expect("checked above");
                client.touch();
                if client.recv.feed(&buf[..n]).has_failed() {
                    self.disconnect(id);
                    return Ok(());
                }
            }

            self.drain_frames(id, now)?;
        }
    }

    fn drain_frames(&mut self, id: ClientId, now: Instant) -> VsoaResult<()> {
        loop {
            let parsed = {
                let client = match self.clients.get_mut(id) {
                    Some(c) => c,
                    None => return Ok(()),
                };
                match client.recv.try_parse() {
                    Ok(Some(frame)) => Some((
                        frame.header,
                        frame.url.to_vec(),
                        frame.param.to_vec(),
                        frame.data.to_vec(),
                    )),
                    Ok(None) => None,
                    Err(_) => {
                        drop(client);
                        self.disconnect(id);
                        return Ok(());
                    }
                }
            };

            let Some((header, url, param, data)) = parsed else { return Ok(()) };
            if let Some(client) = self.clients.get_mut(id) {
                client.recv.consume();
            }

            self.handle_frame(id, header, &url, &param, &data, now);
        }
    }

    fn handle_frame(&mut self, id: ClientId, header: FrameHeader, url: &[u8], param: &[u8], data: &[u8], now: Instant) {
        match header.frame_type {
            FrameType::ServInfo => self.handle_servinfo(id, header.status, param),
            FrameType::Rpc => self.handle_rpc(id, header, url, param, data),
            FrameType::Subscribe => self.handle_subscribe(id, header.seqno, url),
            FrameType::Unsubscribe => self.handle_unsubscribe(id, header.seqno, url),
            FrameType::QosSetup => self.handle_qossetup(id, header.status),
            FrameType::PingEcho => self.handle_ping(id, header.seqno),
            FrameType::Datagram => {
                if let Some(cb) = &self.on_datagram {
                    cb(id, url, param, data);
                }
            }
            // A client never legitimately sends PUBLISH; only the server does.
            FrameType::Publish => {
                slog::warn!(self.log, "client sent PUBLISH, closing"; "client" => id);
                self.disconnect(id);
            }
            FrameType::Noop => {
                let _ = now;
            }
        }
    }

    fn handle_servinfo(&mut self, id: ClientId, _client_status: u8, param: &[u8]) {
        let passwd_ok = match &self.config.passwd {
            None => true,
            Some(expected) => param == expected.as_bytes(),
        };

        let reply_status = if passwd_ok { status::SUCCESS } else { status::PASSWORD };
        // Seqno doubles as the quick-channel client id handed to this connection (see
        // `vsoa_parser.h`'s header comment); harmless for clients that never send quick frames.
        self.shared.send_frame(
            id,
            FrameType::ServInfo,
            Flags::REPLY,
            reply_status,
            id,
            0,
            b"",
            b"",
            self.config.info_json.as_bytes(),
        );

        if !passwd_ok {
            self.disconnect(id);
            return;
        }

        if let Some(client) = self.clients.get_mut(id) {
            client.state = ClientState::Connected;
        }
        if let Some(addr) = self.clients.get(id).map(|c| c.addr) {
            self.changes.push(ServerEvent::Connected(id, addr));
        }
    }

    fn handle_qossetup(&mut self, id: ClientId, priority: u8) {
        if let Some(client) = self.clients.get_mut(id) {
            client.priority = priority;
        }
    }

    fn handle_ping(&mut self, id: ClientId, seqno: u32) {
        self.shared.send_frame(id, FrameType::PingEcho, Flags::REPLY, status::SUCCESS, seqno, 0, b"", b"", b"");
    }

    fn handle_subscribe(&mut self, id: ClientId, seqno: u32, url: &[u8]) {
        self.subs.insert(url, id);
        self.shared.send_frame(id, FrameType::Subscribe, Flags::REPLY, status::SUCCESS, seqno, 0, b"", b"", b"");
    }

    fn handle_unsubscribe(&mut self, id: ClientId, seqno: u32, url: &[u8]) {
        self.subs.remove(url, &id);
        self.shared.send_frame(id, FrameType::Unsubscribe, Flags::REPLY, status::SUCCESS, seqno, 0, b"", b"", b"");
    }

    fn handle_rpc(&mut self, id: ClientId, header: FrameHeader, url: &[u8], param: &[u8], data: &[u8]) {
        let listener = self.rpc.best_match(url).cloned();
        let Some(listener) = listener else {
            self.shared.send_reply(id, header.seqno, header.tunid, status::INVALID_URL, b"", b"");
            return;
        };

        let req = RpcRequest {
            client: id,
            seqno: header.seqno,
            tunid: header.tunid,
            url: url.to_vec(),
            param: param.to_vec(),
            data: data.to_vec(),
        };
        let sink: Arc<dyn ReplySink> = Arc::new(ServerReplySink { shared: self.shared.clone(), client: id, seqno: header.seqno });
        listener.dispatch(req, sink);
    }

    fn housekeeping(&mut self, now: Instant) {
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let stream_keepalive = Duration::from_secs(crate::config::DEF_STREAM_KEEPALIVE_SECS);

        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| match c.state {
                ClientState::Handshake => c.handshake_elapsed() >= handshake_timeout,
                ClientState::Connected => {
                    let keepalive = c.keepalive_secs.map(Duration::from_secs).unwrap_or(stream_keepalive);
                    c.idle_elapsed() >= keepalive * 3
                }
            })
            .map(|c| c.id)
            .collect();

        for id in expired {
            self.disconnect(id);
        }

        for id in self.tunnels.accept_pending() {
            slog::debug!(self.log, "stream tunnel opened"; "tunnel_id" => id);
        }
        for id in self.tunnels.reap_expired(handshake_timeout) {
            slog::debug!(self.log, "stream tunnel reaped (peer never connected)"; "tunnel_id" => id);
        }
        let _ = now;
    }

    fn disconnect_by_sock(&mut self, sock: SockId) {
        let id = self
            .shared
            .sockets
            .lock()
            .expect("socket table lock poisoned")
            .iter()
            .find(|(_, s)| **s == sock)
            .map(|(id, _)| *id);
        if let Some(id) = id {
            self.disconnect(id);
        }
    }

    fn disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(id) else { return };
        let _ = self.handshake_poll.deregister(&client.stream);
        let _ = self.live_poll.deregister(&client.stream);
        self.subs.remove_all(&id);
        self.tunnels.close_owned_by(id);
        self.quick_addrs.remove(&id);

        if let Some(sock) = self.shared.sockets.lock().expect("socket table lock poisoned").remove(&id) {
            self.shared.sender.deregister(sock);
            let idx = self.shared.sender.worker_for(sock);
            self.shared.sender.discard(idx, sock);
        }

        self.changes.push(ServerEvent::Disconnected(id));
    }
}

fn socket_sock_id(stream: &TcpStream) -> Option<SockId> {
    use std::os::unix::io::AsRawFd;
    Some(stream.as_raw_fd() as SockId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    fn handshake_frame(passwd: &[u8]) -> Vec<u8> {
        let (total, pad) = vsoa_codec::header::calc_size(0, passwd.len(), 0, vsoa_codec::MAX_PACKET_LENGTH).unwrap();
        let mut hdr = FrameHeader::new(FrameType::ServInfo, Flags::empty(), status::SUCCESS, 0);
        hdr.param_len = passwd.len() as u32;
        hdr.pad = pad;
        let mut buf = vec![0u8; total];
        vsoa_codec::write_frame(&hdr, b"", passwd, b"", &mut buf).unwrap();
        buf
    }

    fn read_one_frame(stream: &mut StdTcpStream) -> (FrameHeader, Vec<u8>) {
        let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
        stream.read_exact(&mut hdr_buf).unwrap();
        let hdr = FrameHeader::decode(&hdr_buf).unwrap();
        let mut rest = vec![0u8; hdr.frame_len() - vsoa_codec::HEADER_SIZE];
        stream.read_exact(&mut rest).unwrap();
        (hdr, rest)
    }

    fn spin_ticks(server: &mut Server, rounds: usize) {
        for _ in 0..rounds {
            server.tick(Instant::now());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn handshake_publish_and_subscribe_roundtrip() {
        let mut config = ServerConfig::default();
        config.listen_addr = "127.0.0.1:0".to_owned();
        config.info_json = "{\"v\":1}".to_owned();
        let mut server = Server::with_logger(config, vsoa_support::logging::default_logger()).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&handshake_frame(b"")).unwrap();
        spin_ticks(&mut server, 20);

        let (hdr, info) = read_one_frame(&mut client);
        assert_eq!(hdr.frame_type, FrameType::ServInfo);
        assert_eq!(hdr.status, status::SUCCESS);
        assert_eq!(info, b"{\"v\":1}");

        let events = server.events();
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Connected(_, _))));

        let (sub_total, sub_pad) = vsoa_codec::header::calc_size(2, 0, 0, vsoa_codec::MAX_PACKET_LENGTH).unwrap();
        let mut sub_hdr = FrameHeader::new(FrameType::Subscribe, Flags::empty(), status::SUCCESS, 0);
        sub_hdr.url_len = 2;
        sub_hdr.pad = sub_pad;
        let mut sub_buf = vec![0u8; sub_total];
        vsoa_codec::write_frame(&sub_hdr, b"/x", b"", b"", &mut sub_buf).unwrap();
        client.write_all(&sub_buf).unwrap();
        spin_ticks(&mut server, 20);

        let (sub_reply_hdr, _) = read_one_frame(&mut client);
        assert_eq!(sub_reply_hdr.frame_type, FrameType::Subscribe);
        assert_eq!(sub_reply_hdr.status, status::SUCCESS);

        server.publish(b"/x", b"", b"hello");
        spin_ticks(&mut server, 20);

        let (pub_hdr, pub_payload) = read_one_frame(&mut client);
        assert_eq!(pub_hdr.frame_type, FrameType::Publish);
        assert_eq!(&pub_payload[2..], b"hello");
    }

    #[test]
    fn quick_channel_learns_address_and_publishes_back() {
        let mut config = ServerConfig::default();
        config.listen_addr = "127.0.0.1:0".to_owned();
        let mut server = Server::with_logger(config, vsoa_support::logging::default_logger()).unwrap();
        server.enable_quick_channel().unwrap();
        let addr = server.local_addr().unwrap();

        // TCP handshake + subscribe, to learn the real client id the server assigns.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&handshake_frame(b"")).unwrap();
        spin_ticks(&mut server, 20);
        let (hdr, _info) = read_one_frame(&mut client);
        let client_id = hdr.seqno;

        let (sub_total, sub_pad) = vsoa_codec::header::calc_size(2, 0, 0, vsoa_codec::MAX_PACKET_LENGTH).unwrap();
        let mut sub_hdr = FrameHeader::new(FrameType::Subscribe, Flags::empty(), status::SUCCESS, 0);
        sub_hdr.url_len = 2;
        sub_hdr.pad = sub_pad;
        let mut sub_buf = vec![0u8; sub_total];
        vsoa_codec::write_frame(&sub_hdr, b"/x", b"", b"", &mut sub_buf).unwrap();
        client.write_all(&sub_buf).unwrap();
        spin_ticks(&mut server, 20);

        // Tag a quick datagram with the assigned client id, from a fresh UDP socket.
        let quick_sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let (dgram_total, dgram_pad) = vsoa_codec::header::calc_size(2, 0, 3, vsoa_codec::MAX_QPACKET_LENGTH).unwrap();
        let mut dgram_hdr = FrameHeader::new(FrameType::Datagram, Flags::empty(), status::SUCCESS, client_id);
        dgram_hdr.url_len = 2;
        dgram_hdr.data_len = 3;
        dgram_hdr.pad = dgram_pad;
        let mut dgram_buf = vec![0u8; dgram_total];
        vsoa_codec::write_frame(&dgram_hdr, b"/x", b"", b"hi!", &mut dgram_buf).unwrap();
        quick_sock.send_to(&dgram_buf, addr).unwrap();

        spin_ticks(&mut server, 20);
        assert!(server.quick_addrs.contains_key(&client_id));

        server.quick_publish(b"/x", b"", b"bye");
        spin_ticks(&mut server, 5);

        quick_sock.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 256];
        let n = quick_sock.recv(&mut buf).unwrap();
        let reply_hdr = FrameHeader::decode(&buf[..n]).unwrap();
        assert_eq!(reply_hdr.frame_type, FrameType::Publish);
        let payload_start = vsoa_codec::HEADER_SIZE + reply_hdr.url_len as usize;
        assert_eq!(&buf[payload_start..payload_start + reply_hdr.data_len as usize], b"bye");
    }

    #[test]
    fn bad_password_is_rejected_and_disconnects() {
        let mut config = ServerConfig::default();
        config.listen_addr = "127.0.0.1:0".to_owned();
        config.passwd = Some("secret".to_owned());
        let mut server = Server::with_logger(config, vsoa_support::logging::default_logger()).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&handshake_frame(b"wrong")).unwrap();
        spin_ticks(&mut server, 20);

        let (hdr, _) = read_one_frame(&mut client);
        assert_eq!(hdr.status, status::PASSWORD);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn duplicate_rpc_listener_registration_is_rejected() {
        let mut config = ServerConfig::default();
        config.listen_addr = "127.0.0.1:0".to_owned();
        let mut server = Server::with_logger(config, vsoa_support::logging::default_logger()).unwrap();
        server.add_rpc_listener(b"/api/foo").unwrap();
        assert!(server.add_rpc_listener(b"/api/foo").is_err());
    }
}
