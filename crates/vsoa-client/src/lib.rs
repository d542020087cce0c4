pub mod auto;
pub mod client;
pub mod config;
pub mod position;

pub use auto::{AutoClient, ConnectCallback, MessageCallback};
pub use client::{AsyncCallback, Client, Method, Reply, SubscribeCallback};
pub use config::{AutoClientConfig, ClientConfig};
