//! TLS listener with per-connection SNI certificate selection

use crate::certificate::CertificateStore;
use crate::error::{ConfigError, HandshakeError};
use rustls::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Build a rustls server config that resolves certificates through `store`
pub fn server_config(
    store: Arc<CertificateStore>,
    next_protocols: &[String],
) -> Result<ServerConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(store);

    config.alpn_protocols = next_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

    Ok(config)
}

/// Accepts TCP connections and terminates TLS on each one
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsListener {
    pub fn new(
        listener: TcpListener,
        store: Arc<CertificateStore>,
        next_protocols: &[String],
        handshake_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = server_config(store, next_protocols)?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout,
        })
    }

    pub async fn bind(
        addr: SocketAddr,
        store: Arc<CertificateStore>,
        next_protocols: &[String],
        handshake_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, store, next_protocols, handshake_timeout)?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever, handing each completed handshake to `handler`
    ///
    /// Every connection gets its own task; a failed handshake only drops
    /// that connection.
    pub async fn serve<F, Fut>(self, handler: F)
    where
        F: Fn(TlsStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);

        if let Ok(addr) = self.listener.local_addr() {
            info!("TLS listener accepting on {}", addr);
        }

        let listener = &self.listener;

        loop {
            let (stream, remote_addr) = accept_with_backoff(move || listener.accept()).await;

            let _ = stream.set_nodelay(true);
            let acceptor = self.acceptor.clone();
            let handler = handler.clone();
            let handshake_timeout = self.handshake_timeout;

            tokio::spawn(async move {
                match handshake(&acceptor, stream, handshake_timeout).await {
                    Ok(tls) => {
                        debug!(
                            "TLS established with {} (sni={:?})",
                            remote_addr,
                            tls.get_ref().1.server_name()
                        );
                        handler(tls, remote_addr).await;
                    }
                    Err(e) => warn!("TLS handshake with {} failed: {}", remote_addr, e),
                }
            });
        }
    }
}

async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, HandshakeError> {
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    }
}

/// Wait for the next accepted connection
///
/// Aborted or reset connections are skipped. Anything else (usually fd
/// exhaustion) is logged and followed by a pause so the loop cannot spin.
pub(crate) async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) if is_connection_error(&e) => debug!("Accept aborted: {}", e),
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
