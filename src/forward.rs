//! Plain HTTP forwarding over a pooled backend client
//! Bodies are streamed in both directions, never collected

use crate::error::BackendError;
use crate::proxy::ProxyBody;
use crate::router::Backend;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Headers that only describe a single connection leg
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub(crate) const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub(crate) const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forwards requests to HTTP backends, reusing idle connections per target
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Incoming>,
    backend_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration, backend_timeout: Duration, pool_idle_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .build(connector);

        Self {
            client,
            backend_timeout,
        }
    }

    /// Send `req` to `backend` and hand back its response as it streams in
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        backend: &Backend,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, BackendError> {
        let (mut parts, body) = req.into_parts();

        let original_host = original_host(&parts.headers, &parts.uri);
        let target = backend.request_target(parts.uri.path(), parts.uri.query());

        parts.uri = Uri::builder()
            .scheme("http")
            .authority(backend.authority())
            .path_and_query(target)
            .build()?;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        set_forwarded_headers(&mut parts.headers, backend, original_host.as_deref(), client_addr);

        debug!("Forwarding {} {} to {}", parts.method, parts.uri, backend.authority());

        let request = Request::from_parts(parts, body);
        let response = match tokio::time::timeout(self.backend_timeout, self.client.request(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BackendError::ResponseTimeout {
                    authority: backend.authority().to_string(),
                    timeout: self.backend_timeout,
                })
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// The host the client asked for, from `Host` or an absolute-form URI
pub(crate) fn original_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Point `Host` at the backend and record where the request came from
pub(crate) fn set_forwarded_headers(
    headers: &mut HeaderMap,
    backend: &Backend,
    original_host: Option<&str>,
    client_addr: SocketAddr,
) {
    let client_ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, v);
    }

    if let Some(host) = original_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    if let Ok(v) = HeaderValue::from_str(backend.authority()) {
        headers.insert(HOST, v);
    }
}
