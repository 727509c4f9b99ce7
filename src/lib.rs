//! sniproxy - A TLS-terminating, host-routing reverse proxy
//!
//! Provides:
//! - Per-connection certificate selection from the TLS SNI name
//! - Ordered host + path-prefix routing to HTTP backends
//! - Streaming HTTP forwarding over pooled backend connections
//! - WebSocket upgrade proxying with a raw bidirectional relay

pub mod certificate;
pub mod config;
pub mod error;
pub mod forward;
pub mod listener;
pub mod proxy;
pub mod router;
pub mod websocket;

pub use certificate::{CertificateEntry, CertificateSource, CertificateStore, FileSource, MemorySource};
pub use config::{ProxyConfig, ServerSettings};
pub use error::{BackendError, ConfigError, HandshakeError, NoCertificateError, RouteError};
pub use forward::HttpForwarder;
pub use listener::TlsListener;
pub use proxy::{ProxyBody, ProxyServer};
pub use router::{Backend, RouteRule, RouteTable, TargetKind};
