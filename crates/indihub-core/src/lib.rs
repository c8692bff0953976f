//! INDIHUB Agent Core Library
//!
//! The pieces of the agent that are independent of the CLI and the local
//! control API: reassembling the INDI-server's XML stream, tunnelling to
//! the indihub.space relay and the three traffic pipelines built on top.
//!
//! # Modules
//!
//! - [`xml`] - chunked XML stream reassembly and the JSON mapping
//! - [`protocol`] - relay frames and the typed INDI element view
//! - [`tunnel`] - tunnel traits, the WebSocket tunnel and the relay client
//! - [`filter`] - per-direction element filtering
//! - [`proxy`] - share/robotic multiplexing proxy
//! - [`solo`] - solo-mode image publisher
//! - [`broadcast`] - broadcast-mode tee proxy
//! - [`manager`] - INDI-server manager REST client
//! - [`config`] - token config file
//! - [`error`] - error types
//! - [`limits`] - protocol size limits

pub mod broadcast;
pub mod config;
pub mod error;
pub mod filter;
pub mod limits;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod solo;
pub mod tunnel;
pub mod xml;

// Re-export commonly used types
pub use broadcast::BroadcastProxy;
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use filter::{FilterConfig, IndiFilter};
pub use manager::ManagerClient;
pub use protocol::{
    HostInfo, IndiDriver, IndiElement, IndiProfile, RegisterInfo, Request, Response, SoloSummary,
};
pub use proxy::{PublicServerAddr, TcpProxy};
pub use solo::SoloAgent;
pub use tunnel::{RelayClient, RelayConfig, SoloTunnel, Tunnel, WsTunnel};
pub use xml::XmlFlattener;
