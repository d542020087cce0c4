use serde_derive::{Deserialize, Serialize};
use vsoa_support::config::LoggingConfig;

pub const DEF_TIMER_PERIOD_MS: u64 = 10;
pub const DEF_RPC_TIMEOUT_MS: u64 = 60_000;
pub const DEF_SEND_TIMEOUT_MS: u64 = 500;
pub const DEF_STREAM_KEEPALIVE_SECS: u64 = 10;

pub const DEF_MAX_PING_LOST: u32 = 3;
pub const DEF_MAX_INFO_LEN: usize = 2048;
pub const DEF_TURBO_PING_MS: u64 = 25;
pub const DEF_TURBO_MAX_CNT: u32 = 3;
pub const MIN_KEEPALIVE_MS: u64 = 50;
pub const MIN_CONN_TIMEOUT_MS: u64 = 20;
pub const MIN_RECONN_DELAY_MS: u64 = 20;

/// Configuration for a single synchronous/asynchronous `Client` connection.
#[derive(Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub passwd: Option<String>,
    pub rpc_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            server_addr: "127.0.0.1:8080".to_owned(),
            passwd: None,
            rpc_timeout_ms: DEF_RPC_TIMEOUT_MS,
            send_timeout_ms: DEF_SEND_TIMEOUT_MS,
            connect_timeout_ms: 5000,
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> ClientConfig {
        vsoa_support::config::load_toml_file(path)
    }
}

/// Configuration for the reconnecting `AutoClient` robot.
#[derive(Serialize, Deserialize, Clone)]
pub struct AutoClientConfig {
    pub server_addr: String,
    pub passwd: Option<String>,
    pub keepalive_ms: u64,
    pub conn_timeout_ms: u64,
    pub reconn_delay_ms: u64,
    pub max_ping_lost: u32,
    pub turbo_ping_ms: u64,
    pub turbo_max_cnt: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AutoClientConfig {
    fn default() -> AutoClientConfig {
        AutoClientConfig {
            server_addr: "127.0.0.1:8080".to_owned(),
            passwd: None,
            keepalive_ms: 3000,
            conn_timeout_ms: 5000,
            reconn_delay_ms: 1000,
            max_ping_lost: DEF_MAX_PING_LOST,
            turbo_ping_ms: DEF_TURBO_PING_MS,
            turbo_max_cnt: DEF_TURBO_MAX_CNT,
            logging: LoggingConfig::default(),
        }
    }
}

impl AutoClientConfig {
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> AutoClientConfig {
        vsoa_support::config::load_toml_file(path)
    }

    /// Clamps configured intervals to the documented minimums, mirroring `vsoa_cliauto_t`'s
    /// input validation. `turbo_ping_ms == 0` is left alone: it means turbo ping is disabled.
    pub fn normalized(mut self) -> AutoClientConfig {
        self.keepalive_ms = self.keepalive_ms.max(MIN_KEEPALIVE_MS);
        self.conn_timeout_ms = self.conn_timeout_ms.max(MIN_CONN_TIMEOUT_MS);
        self.reconn_delay_ms = self.reconn_delay_ms.max(MIN_RECONN_DELAY_MS);
        if self.turbo_ping_ms != 0 {
            self.turbo_ping_ms = self.turbo_ping_ms.max(DEF_TURBO_PING_MS);
        }
        self.turbo_max_cnt = self.turbo_max_cnt.max(3);
        self
    }
}
