use serde_derive::{Deserialize, Serialize};
use vsoa_support::config::LoggingConfig;

pub const DEF_SEND_TIMEOUT_MS: u64 = 100;
pub const DEF_HANDSHAKE_TIMEOUT_MS: u64 = 5000;
pub const DEF_BACKLOG: i32 = 32;
pub const DEF_STREAM_KEEPALIVE_SECS: u64 = 10;
pub const MAX_RPC_WORKER_THREADS: usize = 8;

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub passwd: Option<String>,
    pub info_json: String,
    pub backlog: i32,
    pub send_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_clients: usize,
    pub sender_workers: usize,
    pub pool_capacity: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen_addr: "0.0.0.0:8080".to_owned(),
            passwd: None,
            info_json: "{}".to_owned(),
            backlog: DEF_BACKLOG,
            send_timeout_ms: DEF_SEND_TIMEOUT_MS,
            handshake_timeout_ms: DEF_HANDSHAKE_TIMEOUT_MS,
            max_clients: 256,
            sender_workers: 4,
            pool_capacity: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> ServerConfig {
        vsoa_support::config::load_toml_file(path)
    }
}
