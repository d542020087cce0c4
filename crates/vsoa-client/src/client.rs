//! Synchronous/asynchronous client core. Grounded on `vsoa_client.h`: a single TCP connection is
//! driven by one background reader thread that demultiplexes replies by `seqno` to pending RPC
//! entries and publishes to per-URL subscription callbacks; writes happen inline on the caller's
//! thread (mirrors the C API's "connect once, call from any thread" contract).

use hashbrown::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::Logger;
use socket2::{SockRef, TcpKeepalive};
use vsoa_codec::{status, FrameHeader, FrameType, Flags, Recv};
use vsoa_support::error::{ErrorUtils, VsoaError, VsoaErrorKind, VsoaResult};

use crate::config::ClientConfig;

/// GET retrieves, SET mutates; mirrors the two RPC verbs `vsoa_client_call` distinguishes via the
/// wire `SET` flag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Method {
    Get,
    Set,
}

/// A completed RPC/ping reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u8,
    pub param: Vec<u8>,
    pub data: Vec<u8>,
}

pub type AsyncCallback = Box<dyn FnOnce(VsoaResult<Reply>) + Send>;
pub type SubscribeCallback = Box<dyn Fn(&[u8], &[u8]) + Send + Sync>;

struct SyncSlot {
    result: Mutex<Option<VsoaResult<Reply>>>,
    cond: Condvar,
}

enum Pending {
    Async(AsyncCallback),
    Sync(Arc<SyncSlot>),
}

struct PendingEntry {
    pending: Pending,
    deadline: Instant,
}

type PendingTable = Arc<Mutex<HashMap<u32, PendingEntry>>>;
type SubscriptionTable = Arc<Mutex<HashMap<Vec<u8>, SubscribeCallback>>>;

/// A connected VSOA client. Disconnecting (explicitly or via `Drop`) wakes every pending call
/// with a `NoResponding` error, matching `vsoa_client_disconnect`'s documented behaviour.
pub struct Client {
    writer: Mutex<TcpStream>,
    seqno: AtomicU32,
    pending: PendingTable,
    subs: SubscriptionTable,
    shutdown: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    send_timeout: Duration,
    /// UDP quick channel, connected to the server's address; `None` when the server refused to
    /// hand out a quick-channel client id (servers that never call `enable_quick_channel`).
    quick: Option<UdpSocket>,
    /// Tag the server assigned us in the `SERVINFO` reply's `seqno` field, stamped into the
    /// `seqno` field of every frame we send on the quick channel (see `vsoa_parser.h`'s header
    /// comment: "Sequence Number / Client ID (Quick)").
    quick_client_id: u32,
    quick_reader: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl Client {
    /// Connects to `config.server_addr`, performs the `SERVINFO` handshake, and starts the
    /// background reader thread. Returns the connected client plus the server's info payload.
    pub fn connect(config: &ClientConfig, log: Logger) -> VsoaResult<(Client, Vec<u8>)> {
        let addr: SocketAddr = config.server_addr.parse()?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(config.connect_timeout_ms))?;
        stream.set_nodelay(true).ok();

        let passwd = config.passwd.as_deref().unwrap_or("").as_bytes();
        write_frame_to(&stream, FrameType::ServInfo, Flags::empty(), 0, 0, b"", passwd, b"", Duration::from_millis(config.send_timeout_ms))?;

        let (quick_client_id, info) = read_servinfo_reply(&stream, Duration::from_millis(config.connect_timeout_ms))?;

        let quick = UdpSocket::bind("0.0.0.0:0").and_then(|sock| { sock.connect(addr)?; Ok(sock) }).ok();

        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let subs: SubscriptionTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = spawn_reader(reader_stream, pending.clone(), subs.clone(), shutdown.clone(), log.new(slog::o!("component" => "client-reader")));

        let quick_reader = quick.as_ref().and_then(|sock| sock.try_clone().ok()).map(|sock| {
            spawn_quick_reader(sock, subs.clone(), shutdown.clone(), log.new(slog::o!("component" => "client-quick-reader")))
        });

        Ok((
            Client {
                writer: Mutex::new(writer_stream),
                seqno: AtomicU32::new(1),
                pending,
                subs,
                shutdown,
                reader: Mutex::new(Some(reader)),
                send_timeout: Duration::from_millis(config.send_timeout_ms),
                quick,
                quick_client_id,
                quick_reader: Mutex::new(quick_reader),
                log,
            },
            info,
        ))
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::SeqCst).max(1)
    }

    fn write_raw(&self, frame_type: FrameType, flags: Flags, status: u8, seqno: u32, url: &[u8], param: &[u8], data: &[u8]) -> VsoaResult<()> {
        let stream = self.writer.lock().expect("writer lock poisoned");
        write_frame_to(&stream, frame_type, flags, status, seqno, url, param, data, self.send_timeout)
    }

    /// Issues an asynchronous RPC call. `cb` runs on the reader thread, either on reply or on
    /// timeout (with a `NoResponding` error and no reply body).
    pub fn call(&self, method: Method, url: &[u8], param: &[u8], data: &[u8], timeout: Duration, cb: AsyncCallback) -> VsoaResult<()> {
        let seqno = self.next_seqno();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(seqno, PendingEntry { pending: Pending::Async(cb), deadline: Instant::now() + timeout });

        let flags = if method == Method::Set { Flags::SET } else { Flags::empty() };
        if let Err(err) = self.write_raw(FrameType::Rpc, flags, 0, seqno, url, param, data) {
            self.pending.lock().expect("pending lock poisoned").remove(&seqno);
            return Err(err);
        }
        Ok(())
    }

    /// Blocking RPC call: the calling thread waits on the pending slot's condvar until the reader
    /// thread resolves it (by reply or timeout sweep).
    pub fn sync_call(&self, method: Method, url: &[u8], param: &[u8], data: &[u8], timeout: Duration) -> VsoaResult<Reply> {
        let seqno = self.next_seqno();
        let slot = Arc::new(SyncSlot { result: Mutex::new(None), cond: Condvar::new() });
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(seqno, PendingEntry { pending: Pending::Sync(slot.clone()), deadline: Instant::now() + timeout });

        let flags = if method == Method::Set { Flags::SET } else { Flags::empty() };
        if let Err(err) = self.write_raw(FrameType::Rpc, flags, 0, seqno, url, param, data) {
            self.pending.lock().expect("pending lock poisoned").remove(&seqno);
            return Err(err);
        }

        wait_on_slot(&slot, timeout, &self.pending, seqno)
    }

    pub fn subscribe(&self, url: &[u8], cb: SubscribeCallback) -> VsoaResult<()> {
        self.subs.lock().expect("subs lock poisoned").insert(url.to_vec(), cb);
        self.write_raw(FrameType::Subscribe, Flags::empty(), 0, 0, url, b"", b"")
    }

    pub fn unsubscribe(&self, url: &[u8]) -> VsoaResult<()> {
        self.subs.lock().expect("subs lock poisoned").remove(url);
        self.write_raw(FrameType::Unsubscribe, Flags::empty(), 0, 0, url, b"", b"")
    }

    /// Blocking ping: a `PingEcho` frame correlated by `seqno` the same way an RPC reply is.
    pub fn ping(&self, timeout: Duration) -> VsoaResult<()> {
        let seqno = self.next_seqno();
        let slot = Arc::new(SyncSlot { result: Mutex::new(None), cond: Condvar::new() });
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(seqno, PendingEntry { pending: Pending::Sync(slot.clone()), deadline: Instant::now() + timeout });

        if let Err(err) = self.write_raw(FrameType::PingEcho, Flags::empty(), 0, seqno, b"", b"", b"") {
            self.pending.lock().expect("pending lock poisoned").remove(&seqno);
            return Err(err);
        }

        wait_on_slot(&slot, timeout, &self.pending, seqno).map(|_| ())
    }

    /// Fire-and-forget publish-style call with no reply (`vsoa_client_datagram`); still goes over
    /// the reliable channel, unlike `quick_datagram`.
    pub fn datagram(&self, url: &[u8], param: &[u8], data: &[u8]) -> VsoaResult<()> {
        self.write_raw(FrameType::Datagram, Flags::empty(), 0, 0, url, param, data)
    }

    /// Fire-and-forget publish-style call over the UDP quick channel (`vsoa_client_quick_datagram`).
    /// Unlike `datagram`, this never blocks on a full TCP send queue, at the cost of best-effort
    /// delivery; the frame is tagged with the client id the server handed out in its `SERVINFO`
    /// reply. Fails if the server never enabled its quick channel.
    pub fn quick_datagram(&self, url: &[u8], param: &[u8], data: &[u8]) -> VsoaResult<()> {
        let sock = self.quick.as_ref().ok_or(VsoaError::Fatal(VsoaErrorKind::ProtocolError))?;
        let (total, pad) = vsoa_codec::header::calc_size(url.len(), param.len(), data.len(), vsoa_codec::MAX_QPACKET_LENGTH)?;
        let mut header = FrameHeader::new(FrameType::Datagram, Flags::empty(), status::SUCCESS, self.quick_client_id);
        header.url_len = url.len() as u16;
        header.param_len = param.len() as u32;
        header.data_len = data.len() as u32;
        header.pad = pad;

        let mut buf = vec![0u8; total];
        vsoa_codec::write_frame(&header, url, param, data, &mut buf)?;
        sock.send(&buf)?;
        Ok(())
    }

    /// Opens a fresh TCP connection to the peer's stream listener for raw byte transport
    /// (`vsoa_client_stream_create`). `tunid` is the tunnel id the server handed back when it
    /// created the tunnel (e.g. as the payload of the RPC reply that negotiated it) and `addr` is
    /// the endpoint it's listening on; both are application-level, not carried by this call. The
    /// returned stream carries no VSOA framing: bytes flow exactly as written and read.
    pub fn stream_create(&self, addr: SocketAddr, tunid: u16, timeout: Duration, keepalive: Option<Duration>) -> VsoaResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        if let Some(period) = keepalive {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(period))?;
        }
        slog::debug!(self.log, "stream tunnel connected"; "tunid" => tunid, "addr" => %addr);
        Ok(stream)
    }

    /// Number of RPC/ping calls still awaiting a reply. Used by the auto-client to decide whether
    /// to switch to turbo ping cadence.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Disconnects, waking every outstanding call with a `NoResponding` error. Idempotent: may be
    /// called any number of times, including implicitly via `Drop`.
    pub fn disconnect(&self) {
        slog::debug!(self.log, "client disconnecting");
        self.shutdown.store(true, Ordering::SeqCst);
        if let Ok(stream) = self.writer.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.quick_reader.lock().expect("quick reader lock poisoned").take() {
            let _ = handle.join();
        }
        fail_all_pending(&self.pending);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn fail_all_pending(pending: &PendingTable) {
    let entries: Vec<(u32, PendingEntry)> = std::mem::take(&mut *pending.lock().expect("pending lock poisoned")).into_iter().collect();
    for (_, entry) in entries {
        resolve_pending(entry.pending, Err(VsoaError::Fatal(VsoaErrorKind::NoSuchClient)));
    }
}

/// Blocks the calling thread on `slot` until the reader thread resolves it or `timeout` elapses.
/// On timeout, removes the (still-pending) entry from `table` so it is not resolved twice.
fn wait_on_slot(slot: &Arc<SyncSlot>, timeout: Duration, table: &PendingTable, seqno: u32) -> VsoaResult<Reply> {
    let deadline = Instant::now() + timeout;
    let mut guard = slot.result.lock().expect("sync slot lock poisoned");
    while guard.is_none() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let (new_guard, _) = slot.cond.wait_timeout(guard, deadline - now).expect("sync slot lock poisoned");
        guard = new_guard;
    }

    match guard.take() {
        Some(result) => result,
        None => {
            drop(guard);
            table.lock().expect("pending lock poisoned").remove(&seqno);
            Err(VsoaError::Fatal(VsoaErrorKind::NoSuchClient))
        }
    }
}

fn resolve_pending(pending: Pending, result: VsoaResult<Reply>) {
    match pending {
        Pending::Async(cb) => cb(result),
        Pending::Sync(slot) => {
            *slot.result.lock().expect("sync slot lock poisoned") = Some(result);
            slot.cond.notify_all();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_frame_to(
    mut stream: &TcpStream,
    frame_type: FrameType,
    flags: Flags,
    status: u8,
    seqno: u32,
    url: &[u8],
    param: &[u8],
    data: &[u8],
    timeout: Duration,
) -> VsoaResult<()> {
    let (total, pad) = vsoa_codec::header::calc_size(url.len(), param.len(), data.len(), vsoa_codec::MAX_PACKET_LENGTH)?;
    let mut header = FrameHeader::new(frame_type, flags, status, seqno);
    header.url_len = url.len() as u16;
    header.param_len = param.len() as u32;
    header.data_len = data.len() as u32;
    header.pad = pad;

    let mut buf = vec![0u8; total];
    vsoa_codec::write_frame(&header, url, param, data, &mut buf)?;

    stream.set_write_timeout(Some(timeout)).ok();
    stream.write_all(&buf)?;
    Ok(())
}

/// Reads the `SERVINFO` reply and returns `(quick_client_id, info)`: the `seqno` field doubles as
/// the id the server wants this client to tag quick-channel frames with (0 if the server has no
/// quick channel enabled), alongside the server's info payload.
fn read_servinfo_reply(mut stream: &TcpStream, timeout: Duration) -> VsoaResult<(u32, Vec<u8>)> {
    stream.set_read_timeout(Some(timeout)).ok();

    let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
    stream.read_exact(&mut hdr_buf)?;
    let header = FrameHeader::decode(&hdr_buf)?;
    if header.frame_type != FrameType::ServInfo {
        return Err(VsoaError::Fatal(VsoaErrorKind::ProtocolError));
    }

    let mut rest = vec![0u8; header.frame_len() - vsoa_codec::HEADER_SIZE];
    stream.read_exact(&mut rest)?;

    if header.status != status::SUCCESS {
        return Err(VsoaError::Fatal(VsoaErrorKind::BadPassword));
    }

    if header.data_len as usize > crate::config::DEF_MAX_INFO_LEN {
        return Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge));
    }

    let data_start = header.url_len as usize + header.param_len as usize;
    Ok((header.seqno, rest[data_start..data_start + header.data_len as usize].to_vec()))
}

fn spawn_reader(stream: TcpStream, pending: PendingTable, subs: SubscriptionTable, shutdown: Arc<AtomicBool>, log: Logger) -> JoinHandle<()> {
    thread::Builder::new()
        .name("vsoa-client-reader".to_owned())
        .spawn(move || reader_loop(stream, pending, subs, shutdown, log))
        .expect("failed to spawn client reader thread")
}

fn reader_loop(stream: TcpStream, pending: PendingTable, subs: SubscriptionTable, shutdown: Arc<AtomicBool>, log: Logger) {
    stream.set_read_timeout(Some(Duration::from_millis(crate::config::DEF_TIMER_PERIOD_MS))).ok();
    let mut recv = Recv::new();
    let mut io_stream = stream;
    let mut buf = [0u8; 65536];

    while !shutdown.load(Ordering::SeqCst) {
        match io_stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if recv.feed(&buf[..n]).has_failed() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }

        loop {
            let parsed = match recv.try_parse() {
                Ok(Some(frame)) => Some((frame.header, frame.url.to_vec(), frame.param.to_vec(), frame.data.to_vec())),
                Ok(None) => None,
                Err(_) => {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            };
            let Some((header, url, param, data)) = parsed else { break };
            recv.consume();
            dispatch_frame(header, url, param, data, &pending, &subs, &log);
        }

        sweep_expired(&pending);
    }

    fail_all_pending(&pending);
}

fn spawn_quick_reader(sock: UdpSocket, subs: SubscriptionTable, shutdown: Arc<AtomicBool>, log: Logger) -> JoinHandle<()> {
    thread::Builder::new()
        .name("vsoa-client-quick-reader".to_owned())
        .spawn(move || quick_reader_loop(sock, subs, shutdown, log))
        .expect("failed to spawn client quick-channel reader thread")
}

/// Drains `Publish` frames arriving on the UDP quick channel and routes them through the same
/// subscription table as the reliable channel; a subscriber doesn't care which channel its
/// publish arrived on.
fn quick_reader_loop(sock: UdpSocket, subs: SubscriptionTable, shutdown: Arc<AtomicBool>, log: Logger) {
    sock.set_read_timeout(Some(Duration::from_millis(crate::config::DEF_TIMER_PERIOD_MS))).ok();
    let mut buf = [0u8; vsoa_codec::MAX_QPACKET_LENGTH];

    while !shutdown.load(Ordering::SeqCst) {
        let n = match sock.recv(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => continue,
            Err(_) => break,
        };

        let header = match FrameHeader::decode(&buf[..n]) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if header.frame_type != FrameType::Publish {
            continue;
        }
        let url_end = header.url_len as usize;
        let param_end = url_end + header.param_len as usize;
        let data_end = param_end + header.data_len as usize;
        let Some(payload) = buf.get(vsoa_codec::HEADER_SIZE..vsoa_codec::HEADER_SIZE + data_end) else { continue };
        if let Some(cb) = subs.lock().expect("subs lock poisoned").get(&payload[..url_end]) {
            cb(&payload[url_end..param_end], &payload[param_end..data_end]);
        } else {
            slog::trace!(log, "quick publish for unknown url");
        }
    }
}

fn dispatch_frame(header: FrameHeader, url: Vec<u8>, param: Vec<u8>, data: Vec<u8>, pending: &PendingTable, subs: &SubscriptionTable, log: &Logger) {
    match header.frame_type {
        FrameType::Rpc | FrameType::PingEcho => {
            let entry = pending.lock().expect("pending lock poisoned").remove(&header.seqno);
            if let Some(entry) = entry {
                resolve_pending(entry.pending, Ok(Reply { status: header.status, param, data }));
            }
        }
        FrameType::Publish => {
            if let Some(cb) = subs.lock().expect("subs lock poisoned").get(&url) {
                cb(&param, &data);
            }
        }
        _ => {
            slog::trace!(log, "ignoring unexpected frame on client connection"; "type" => ?header.frame_type);
        }
    }
}

fn sweep_expired(pending: &PendingTable) {
    let now = Instant::now();
    let expired: Vec<(u32, PendingEntry)> = {
        let mut table = pending.lock().expect("pending lock poisoned");
        let expired_keys: Vec<u32> = table.iter().filter(|(_, e)| now >= e.deadline).map(|(k, _)| *k).collect();
        expired_keys.into_iter().filter_map(|k| table.remove(&k).map(|e| (k, e))).collect()
    };
    for (_, entry) in expired {
        resolve_pending(entry.pending, Err(VsoaError::Fatal(VsoaErrorKind::NoSuchClient)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn spawn_echo_server() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn serve_handshake_and_one_rpc(listener: TcpListener) {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut hdr_buf).unwrap();
            let hdr = FrameHeader::decode(&hdr_buf).unwrap();
            let mut rest = vec![0u8; hdr.frame_len() - vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut rest).unwrap();
            assert_eq!(hdr.frame_type, FrameType::ServInfo);

            write_frame_to(&stream, FrameType::ServInfo, Flags::REPLY, status::SUCCESS, 0, b"", b"", b"{}", Duration::from_secs(1)).unwrap();

            let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut hdr_buf).unwrap();
            let hdr = FrameHeader::decode(&hdr_buf).unwrap();
            let mut rest = vec![0u8; hdr.frame_len() - vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut rest).unwrap();
            assert_eq!(hdr.frame_type, FrameType::Rpc);

            write_frame_to(&stream, FrameType::Rpc, Flags::REPLY, status::SUCCESS, hdr.seqno, b"", b"", b"pong", Duration::from_secs(1)).unwrap();
        });
    }

    #[test]
    fn connect_and_sync_call_roundtrip() {
        let (listener, addr) = spawn_echo_server();
        serve_handshake_and_one_rpc(listener);

        let mut config = ClientConfig::default();
        config.server_addr = addr.to_string();
        let (client, info) = Client::connect(&config, vsoa_support::logging::default_logger()).unwrap();
        assert_eq!(info, b"{}");

        let reply = client.sync_call(Method::Get, b"/x", b"", b"", Duration::from_secs(1)).unwrap();
        assert_eq!(reply.data, b"pong");
    }

    #[test]
    fn read_servinfo_reply_rejects_oversized_info() {
        let (listener, addr) = spawn_echo_server();
        let oversized = vec![b'x'; crate::config::DEF_MAX_INFO_LEN + 1];
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            write_frame_to(&stream, FrameType::ServInfo, Flags::REPLY, status::SUCCESS, 0, b"", b"", &oversized, Duration::from_secs(1)).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = read_servinfo_reply(&stream, Duration::from_secs(1));
        assert_eq!(result, Err(VsoaError::Fatal(VsoaErrorKind::PacketTooLarge)));
    }

    #[test]
    fn stream_create_connects_to_the_peers_tunnel_listener() {
        let (listener, addr) = spawn_echo_server();
        serve_handshake_and_one_rpc(listener);

        let mut config = ClientConfig::default();
        config.server_addr = addr.to_string();
        let (client, _info) = Client::connect(&config, vsoa_support::logging::default_logger()).unwrap();
        let _ = client.sync_call(Method::Get, b"/x", b"", b"", Duration::from_secs(1)).unwrap();

        let tunnel_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let tunnel_addr = tunnel_listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = tunnel_listener.accept();
        });

        let stream = client.stream_create(tunnel_addr, 7, Duration::from_secs(1), Some(Duration::from_secs(30))).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), tunnel_addr);
    }

    #[test]
    fn sync_call_times_out_with_no_response() {
        let (listener, addr) = spawn_echo_server();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut hdr_buf).unwrap();
            let hdr = FrameHeader::decode(&hdr_buf).unwrap();
            let mut rest = vec![0u8; hdr.frame_len() - vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut rest).unwrap();
            write_frame_to(&stream, FrameType::ServInfo, Flags::REPLY, status::SUCCESS, 0, b"", b"", b"{}", Duration::from_secs(1)).unwrap();
            // never reply to the RPC that follows
            std::thread::sleep(Duration::from_secs(2));
        });

        let mut config = ClientConfig::default();
        config.server_addr = addr.to_string();
        let (client, _info) = Client::connect(&config, vsoa_support::logging::default_logger()).unwrap();

        let result = client.sync_call(Method::Get, b"/nope", b"", b"", Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn quick_datagram_is_tagged_with_the_assigned_client_id() {
        let (listener, addr) = spawn_echo_server();
        let quick_listener = std::net::UdpSocket::bind(addr).unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hdr_buf = [0u8; vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut hdr_buf).unwrap();
            let hdr = FrameHeader::decode(&hdr_buf).unwrap();
            let mut rest = vec![0u8; hdr.frame_len() - vsoa_codec::HEADER_SIZE];
            stream.read_exact(&mut rest).unwrap();
            // 4242 stands in for the client id the server's handshake handler would assign.
            write_frame_to(&stream, FrameType::ServInfo, Flags::REPLY, status::SUCCESS, 4242, b"", b"", b"{}", Duration::from_secs(1)).unwrap();
        });

        let mut config = ClientConfig::default();
        config.server_addr = addr.to_string();
        let (client, _info) = Client::connect(&config, vsoa_support::logging::default_logger()).unwrap();

        client.quick_datagram(b"/q", b"", b"ping").unwrap();

        quick_listener.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 256];
        let (n, _from) = quick_listener.recv_from(&mut buf).unwrap();
        let hdr = FrameHeader::decode(&buf[..n]).unwrap();
        assert_eq!(hdr.frame_type, FrameType::Datagram);
        assert_eq!(hdr.seqno, 4242);
        let data_start = vsoa_codec::HEADER_SIZE + hdr.url_len as usize + hdr.param_len as usize;
        assert_eq!(&buf[data_start..data_start + hdr.data_len as usize], b"ping");
    }
}
