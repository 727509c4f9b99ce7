//! Error types for configuration, handshakes, routing and backend traffic
//!
//! Only `ConfigError` is fatal. Everything else is scoped to a single
//! connection or request and is turned into a response or a closed socket.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup-time configuration failure. The server must not start serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no certificates configured")]
    NoCertificates,

    #[error("certificate for {hostname}: {reason}")]
    Certificate { hostname: String, reason: String },

    #[error("private key for {hostname} does not match its certificate")]
    KeyMismatch { hostname: String },

    #[error("invalid backend target {target}: {reason}")]
    InvalidBackend { target: String, reason: String },

    #[error("invalid route {host}{path_prefix}: {reason}")]
    InvalidRoute {
        host: String,
        path_prefix: String,
        reason: String,
    },

    #[error("invalid application protocol list: {0}")]
    InvalidProtocols(String),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// A TLS handshake that did not complete. Drops only that connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Tls(#[from] io::Error),
}

/// No rule matched the request's host and path.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for {host}{path}")]
    NoRoute { host: String, path: String },
}

/// Failure talking to a backend, for a single request or upgraded session.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },

    #[error("connecting to {authority} timed out after {timeout:?}")]
    ConnectTimeout { authority: String, timeout: Duration },

    #[error("backend {authority} did not respond within {timeout:?}")]
    ResponseTimeout { authority: String, timeout: Duration },

    #[error("request to backend failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("backend HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid backend request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// `CertificateStore::select` on a store with nothing to offer.
#[derive(Debug, Error)]
#[error("no certificate available for server name {server_name:?}")]
pub struct NoCertificateError {
    pub server_name: Option<String>,
}
