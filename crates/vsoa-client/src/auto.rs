//! Reconnecting client robot. Grounded on `vsoa_cliauto.h`: owns a background thread that
//! connects, subscribes, replays consistency URLs as synthetic publishes, pings on a keepalive
//! timer, and reconnects after any failure, so callers never have to write that state machine
//! themselves.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::Logger;

use crate::client::{Client, Method};
use crate::config::{AutoClientConfig, ClientConfig};
use crate::position;

/// Connection lifecycle state, reported to `onconn` on every transition into/out of `Ready`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AutoState {
    Idle,
    Connecting,
    Ready,
    ReconnectWait,
}

/// `on_message(url, param, data)` for every subscribed publish (including consistency replay).
pub type MessageCallback = Box<dyn Fn(&[u8], &[u8], &[u8]) + Send + Sync>;
/// `on_connect(connected, info)`; `info` is empty on disconnect.
pub type ConnectCallback = Box<dyn Fn(bool, &[u8]) + Send + Sync>;

struct ConsistencyEntry {
    url: Vec<u8>,
    timeout: Duration,
}

struct Shared {
    config: Mutex<AutoClientConfig>,
    subscriptions: Mutex<Vec<Vec<u8>>>,
    consistency: Mutex<Vec<ConsistencyEntry>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_connect: Mutex<Option<ConnectCallback>>,
    client: Mutex<Option<Arc<Client>>>,
    server_addr: Mutex<Option<SocketAddr>>,
    log: Logger,
}

/// The reconnecting client robot. `start`/`stop` bracket the background thread's lifetime, same
/// as `vsoa_client_auto_start`/`vsoa_client_auto_stop`.
pub struct AutoClient {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AutoClient {
    pub fn new(config: AutoClientConfig, log: Logger) -> AutoClient {
        AutoClient {
            shared: Arc::new(Shared {
                config: Mutex::new(config.normalized()),
                subscriptions: Mutex::new(Vec::new()),
                consistency: Mutex::new(Vec::new()),
                on_message: Mutex::new(None),
                on_connect: Mutex::new(None),
                client: Mutex::new(None),
                server_addr: Mutex::new(None),
                log,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn on_message(&self, cb: MessageCallback) {
        *self.shared.on_message.lock().expect("on_message lock poisoned") = Some(cb);
    }

    pub fn on_connect(&self, cb: ConnectCallback) {
        *self.shared.on_connect.lock().expect("on_connect lock poisoned") = Some(cb);
    }

    /// URLs subscribed on every (re)connect.
    pub fn subscribe(&self, urls: &[&[u8]]) {
        *self.shared.subscriptions.lock().expect("subscriptions lock poisoned") = urls.iter().map(|u| u.to_vec()).collect();
    }

    /// Registers URLs for GET-and-replay-as-publish consistency recovery after reconnect. Must be
    /// called before `start`.
    pub fn set_consistency(&self, urls: &[&[u8]], rpc_timeout: Duration) {
        *self.shared.consistency.lock().expect("consistency lock poisoned") =
            urls.iter().map(|u| ConsistencyEntry { url: u.to_vec(), timeout: rpc_timeout }).collect();
    }

    /// Starts the reconnect loop. Calling `start` twice without an intervening `stop` is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut thread = self.thread.lock().expect("thread lock poisoned");
        if thread.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let this = self.clone();
        *thread = Some(
            thread::Builder::new()
                .name("vsoa-client-auto".to_owned())
                .spawn(move || this.run())
                .expect("failed to spawn client auto thread"),
        );
    }

    /// Stops the reconnect loop and disconnects the current client, if any.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("thread lock poisoned").take() {
            let _ = handle.join();
        }
        if let Some(client) = self.shared.client.lock().expect("client lock poisoned").take() {
            client.disconnect();
        }
    }

    /// The currently connected client, if any. Valid for sending calls/subscriptions; must not be
    /// used to disconnect directly (that would desync the robot's state machine).
    pub fn handle(&self) -> Option<Arc<Client>> {
        self.shared.client.lock().expect("client lock poisoned").clone()
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        *self.shared.server_addr.lock().expect("server_addr lock poisoned")
    }

    fn run(self: Arc<Self>) {
        let mut state = AutoState::Idle;
        while !self.shutdown.load(Ordering::SeqCst) {
            state = match state {
                AutoState::Idle | AutoState::ReconnectWait => AutoState::Connecting,
                AutoState::Connecting => {
                    if self.try_connect() {
                        AutoState::Ready
                    } else {
                        self.wait_reconnect_delay();
                        AutoState::ReconnectWait
                    }
                }
                AutoState::Ready => {
                    self.run_keepalive_loop();
                    self.notify_connect(false, b"");
                    AutoState::ReconnectWait
                }
            };
        }
        if let Some(client) = self.shared.client.lock().expect("client lock poisoned").take() {
            client.disconnect();
        }
    }

    fn wait_reconnect_delay(&self) {
        let delay = Duration::from_millis(self.shared.config.lock().expect("config lock poisoned").reconn_delay_ms);
        let deadline = Instant::now() + delay;
        while !self.shutdown.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn try_connect(&self) -> bool {
        let config = self.shared.config.lock().expect("config lock poisoned").clone();
        let resolved = match position::resolve(&config.server_addr) {
            Ok(addr) => addr,
            Err(err) => {
                slog::warn!(self.shared.log, "auto-client address resolution failed"; "error" => %err);
                return false;
            }
        };
        *self.shared.server_addr.lock().expect("server_addr lock poisoned") = Some(resolved);

        let client_config = ClientConfig {
            server_addr: resolved.to_string(),
            passwd: config.passwd.clone(),
            rpc_timeout_ms: crate::config::DEF_RPC_TIMEOUT_MS,
            send_timeout_ms: crate::config::DEF_SEND_TIMEOUT_MS,
            connect_timeout_ms: config.conn_timeout_ms,
            logging: Default::default(),
        };

        let (client, info) = match Client::connect(&client_config, self.shared.log.new(slog::o!("component" => "auto-client"))) {
            Ok(pair) => pair,
            Err(err) => {
                slog::warn!(self.shared.log, "auto-client connect failed"; "error" => %err);
                return false;
            }
        };
        let client = Arc::new(client);

        self.wire_subscriptions(&client);

        *self.shared.client.lock().expect("client lock poisoned") = Some(client.clone());
        self.notify_connect(true, &info);
        self.replay_consistency(&client);
        true
    }

    /// Re-subscribes every registered URL on the freshly connected client, routing each publish
    /// through the current `on_message` callback (looked up at delivery time, so a callback
    /// registered after `start` still takes effect).
    fn wire_subscriptions(&self, client: &Arc<Client>) {
        let shared = self.shared.clone();
        for url in self.shared.subscriptions.lock().expect("subscriptions lock poisoned").clone() {
            let shared = shared.clone();
            let _ = client.subscribe(
                &url,
                Box::new(move |param: &[u8], data: &[u8]| {
                    if let Some(cb) = shared.on_message.lock().expect("on_message lock poisoned").as_ref() {
                        cb(&url, param, data);
                    }
                }),
            );
        }
    }

    /// Runs a synchronous `GET` against every registered consistency URL and delivers the result
    /// through `on_message`, the way the server's own `PUBLISH` would — so state observed before a
    /// disconnect is resynchronized once the reconnect completes.
    fn replay_consistency(&self, client: &Arc<Client>) {
        for entry in self.shared.consistency.lock().expect("consistency lock poisoned").iter() {
            match client.sync_call(Method::Get, &entry.url, b"", b"", entry.timeout) {
                Ok(reply) => {
                    if let Some(cb) = self.shared.on_message.lock().expect("on_message lock poisoned").as_ref() {
                        cb(&entry.url, &reply.param, &reply.data);
                    }
                }
                Err(err) => {
                    slog::warn!(self.shared.log, "consistency replay failed"; "url" => String::from_utf8_lossy(&entry.url).into_owned(), "error" => %err);
                }
            }
        }
    }

    fn notify_connect(&self, connected: bool, info: &[u8]) {
        if let Some(cb) = self.shared.on_connect.lock().expect("on_connect lock poisoned").as_ref() {
            cb(connected, info);
        }
    }

    /// Pings on the keepalive interval until `max_ping_lost` consecutive pings fail, the socket is
    /// closed by the peer, or a stop is requested. Returns once the connection should be torn down.
    ///
    /// While an RPC is outstanding, switches to `turbo_ping_ms` cadence for up to `turbo_max_cnt`
    /// consecutive pings to provoke TCP fast retransmit, then reverts to `keepalive_ms`.
    fn run_keepalive_loop(&self) {
        let (keepalive, max_ping_lost, turbo_ping, turbo_max_cnt) = {
            let config = self.shared.config.lock().expect("config lock poisoned");
            (
                Duration::from_millis(config.keepalive_ms),
                config.max_ping_lost,
                Duration::from_millis(config.turbo_ping_ms),
                config.turbo_max_cnt,
            )
        };

        let client = match self.shared.client.lock().expect("client lock poisoned").clone() {
            Some(client) => client,
            None => return,
        };

        let mut consecutive_losses = 0u32;
        let mut turbo_bursts_left = 0u32;
        while !self.shutdown.load(Ordering::SeqCst) {
            let interval = if turbo_bursts_left > 0 { turbo_ping } else { keepalive };
            thread::sleep(interval);
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if turbo_bursts_left > 0 {
                turbo_bursts_left -= 1;
            } else if !turbo_ping.is_zero() && client.pending_count() > 0 {
                turbo_bursts_left = turbo_max_cnt.saturating_sub(1);
            }

            match client.ping(keepalive) {
                Ok(()) => consecutive_losses = 0,
                Err(_) => {
                    consecutive_losses += 1;
                    slog::warn!(self.shared.log, "auto-client ping lost"; "consecutive" => consecutive_losses);
                    if consecutive_losses >= max_ping_lost {
                        break;
                    }
                }
            }
        }

        if let Some(client) = self.shared.client.lock().expect("client lock poisoned").take() {
            client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use vsoa_codec::{status, FrameHeader, FrameType, Flags, HEADER_SIZE};

    fn serve_one_connection(listener: TcpListener, events: mpsc::Sender<&'static str>) {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hdr_buf = [0u8; HEADER_SIZE];
            stream.read_exact(&mut hdr_buf).unwrap();
            let hdr = FrameHeader::decode(&hdr_buf).unwrap();
            let mut rest = vec![0u8; hdr.frame_len() - HEADER_SIZE];
            stream.read_exact(&mut rest).unwrap();

            let (total, pad) = vsoa_codec::header::calc_size(0, 0, 2, vsoa_codec::MAX_PACKET_LENGTH).unwrap();
            let mut reply = FrameHeader::new(FrameType::ServInfo, Flags::REPLY, status::SUCCESS, 0);
            reply.data_len = 2;
            reply.pad = pad;
            let mut buf = vec![0u8; total];
            vsoa_codec::write_frame(&reply, b"", b"", b"{}", &mut buf).unwrap();
            stream.write_all(&buf).unwrap();
            let _ = events.send("handshake");

            // answer every subsequent RPC/ping (subscribe/unsubscribe don't get replies)
            loop {
                let mut hdr_buf = [0u8; HEADER_SIZE];
                if stream.read_exact(&mut hdr_buf).is_err() {
                    break;
                }
                let hdr = FrameHeader::decode(&hdr_buf).unwrap();
                let mut rest = vec![0u8; hdr.frame_len() - HEADER_SIZE];
                stream.read_exact(&mut rest).unwrap();
                if hdr.frame_type == FrameType::Rpc || hdr.frame_type == FrameType::PingEcho {
                    let (total, pad) = vsoa_codec::header::calc_size(0, 0, 0, vsoa_codec::MAX_PACKET_LENGTH).unwrap();
                    let mut reply = FrameHeader::new(hdr.frame_type, Flags::REPLY, status::SUCCESS, hdr.seqno);
                    reply.pad = pad;
                    let mut buf = vec![0u8; total];
                    vsoa_codec::write_frame(&reply, b"", b"", b"", &mut buf).unwrap();
                    let _ = stream.write_all(&buf);
                }
            }
        });
    }

    #[test]
    fn connects_and_reports_connect_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        serve_one_connection(listener, tx);

        let mut config = AutoClientConfig::default();
        config.server_addr = addr.to_string();
        config.keepalive_ms = 50;
        config.conn_timeout_ms = 1000;
        config.reconn_delay_ms = 50;

        let auto = Arc::new(AutoClient::new(config, vsoa_support::logging::default_logger()));
        let (conn_tx, conn_rx) = mpsc::channel();
        auto.on_connect(Box::new(move |connected, _info| {
            let _ = conn_tx.send(connected);
        }));
        auto.start();

        rx.recv_timeout(Duration::from_secs(2)).expect("server never saw handshake");
        assert!(conn_rx.recv_timeout(Duration::from_secs(2)).unwrap());

        auto.stop();
    }
}
