//! WebSocket upgrade proxying
//!
//! An upgrade request gets its own backend TCP connection. The request is
//! replayed there, and if the backend answers `101 Switching Protocols` both
//! connections are taken over from hyper and spliced together byte for byte.
//! Any other answer is handed back to the client unchanged.

use crate::error::BackendError;
use crate::forward::{original_host, set_forwarded_headers};
use crate::proxy::{empty_body, ProxyBody};
use crate::router::RouteRule;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// `Upgrade: websocket` together with an `upgrade` token in `Connection`
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let upgrade_ws = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    upgrade_ws && connection_upgrade
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade request received, backend not contacted yet
    Pending,
    /// Backend connection open, waiting for its answer
    Handshaking,
    /// Both sides upgraded; bytes are flowing
    Established,
    Closed,
}

/// Bookkeeping for one upgraded client connection
#[derive(Debug)]
pub struct ProxySession {
    client_addr: SocketAddr,
    route: String,
    backend: String,
    state: SessionState,
}

impl ProxySession {
    pub fn new(client_addr: SocketAddr, rule: &RouteRule) -> Self {
        Self {
            client_addr,
            route: format!("{}{}", rule.host, rule.path_prefix),
            backend: rule.backend.authority().to_string(),
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`; `Closed` is terminal
    pub fn transition(&mut self, next: SessionState) {
        if self.state == SessionState::Closed {
            return;
        }

        debug!(
            "ws {} -> {} via {}: {:?} -> {:?}",
            self.client_addr, self.backend, self.route, self.state, next
        );
        self.state = next;
    }
}

impl fmt::Display for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws {} -> {}", self.client_addr, self.backend)
    }
}

/// Proxy an upgrade request to the rule's backend
///
/// Returns the response for the client: a `101` whose relay runs in a
/// spawned task, or the backend's refusal as-is. Dialing is bounded by
/// `connect_timeout`; the handshake and the backend's answer together by
/// `backend_timeout`.
pub async fn proxy_upgrade(
    mut req: Request<Incoming>,
    rule: &RouteRule,
    client_addr: SocketAddr,
    connect_timeout: Duration,
    backend_timeout: Duration,
) -> Result<Response<ProxyBody>, BackendError> {
    let backend = &rule.backend;
    let mut session = ProxySession::new(client_addr, rule);

    // Must be taken before the request is torn apart
    let client_upgrade = hyper::upgrade::on(&mut req);

    session.transition(SessionState::Handshaking);
    let stream = match dial(backend.authority(), connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            session.transition(SessionState::Closed);
            return Err(e);
        }
    };

    let (parts, _body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let mut headers = parts.headers;
    let host = original_host(&headers, &uri);
    set_forwarded_headers(&mut headers, backend, host.as_deref(), client_addr);

    let conn_label = session.to_string();
    let mut conn_task = None;

    let exchange = async {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        conn_task = Some(tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("{}: backend connection error: {}", conn_label, e);
            }
        }));

        let mut upstream = Request::builder()
            .method(method)
            .uri(backend.request_target(uri.path(), uri.query()))
            .version(Version::HTTP_11)
            .body(Empty::<Bytes>::new())?;
        *upstream.headers_mut() = headers;

        Ok::<_, BackendError>(sender.send_request(upstream).await?)
    };

    let result = match tokio::time::timeout(backend_timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::ResponseTimeout {
            authority: backend.authority().to_string(),
            timeout: backend_timeout,
        }),
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => {
            if let Some(task) = conn_task {
                task.abort();
            }
            session.transition(SessionState::Closed);
            return Err(e);
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!("{}: backend refused upgrade with {}", session, response.status());
        session.transition(SessionState::Closed);
        let (parts, body) = response.into_parts();
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let backend_upgrade = hyper::upgrade::on(&mut response);

    let mut to_client = Response::new(empty_body());
    *to_client.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *to_client.headers_mut() = response.headers().clone();

    tokio::spawn(async move {
        let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("{}: upgrade did not complete: {}", session, e);
                session.transition(SessionState::Closed);
                return;
            }
        };

        session.transition(SessionState::Established);
        if let Err(e) = relay(TokioIo::new(client_io), TokioIo::new(backend_io)).await {
            debug!("{}: relay ended with error: {}", session, e);
        }
        session.transition(SessionState::Closed);
    });

    Ok(to_client)
}

async fn dial(authority: &str, timeout: Duration) -> Result<TcpStream, BackendError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(BackendError::Connect {
                authority: authority.to_string(),
                source: e,
            })
        }
        Err(_) => {
            return Err(BackendError::ConnectTimeout {
                authority: authority.to_string(),
                timeout,
            })
        }
    };

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Copy bytes both ways until either side finishes
///
/// When one direction reaches EOF or fails, the write half it was feeding is
/// shut down and both streams are dropped, so neither connection outlives the
/// other.
pub async fn relay<C, B>(client: C, backend: B) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let bytes = tokio::io::copy(&mut client_read, &mut backend_write).await?;
        backend_write.shutdown().await?;
        Ok::<_, io::Error>(bytes)
    };

    let downstream = async {
        let bytes = tokio::io::copy(&mut backend_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<_, io::Error>(bytes)
    };

    tokio::select! {
        result = upstream => {
            let bytes = result?;
            debug!("Client closed relay after {} bytes upstream", bytes);
        }
        result = downstream => {
            let bytes = result?;
            debug!("Backend closed relay after {} bytes downstream", bytes);
        }
    }

    Ok(())
}
