//! Local HTTP/WS control API.

pub mod server;
pub mod tls;
pub mod ws_bridge;

pub use server::{serve, ApiState, OriginPolicy};
