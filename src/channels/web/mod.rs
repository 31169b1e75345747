//! HTTP API over the case lifecycle.

pub mod server;
pub mod types;

pub use self::server::{GatewayState, start_server};
