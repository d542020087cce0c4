pub mod client;
pub mod config;
pub mod listener;
pub mod server;
pub mod stream;

pub use client::{Client, ClientId, ClientState, ClientTable};
pub use config::ServerConfig;
pub use listener::{Plistener, RpcListener, RpcRequest};
pub use server::{Server, ServerEvent};
pub use stream::{Tunnel, TunnelId, TunnelRegistry};
