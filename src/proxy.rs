//! Proxy server implementation
//! Terminates TLS, routes decrypted requests by host and path, and forwards
//! them as plain HTTP or upgraded WebSocket traffic

use crate::certificate::{CertificateSource, CertificateStore};
use crate::config::{ProxyConfig, ServerSettings};
use crate::error::ConfigError;
use crate::forward::{original_host, HttpForwarder};
use crate::listener::{accept_with_backoff, TlsListener};
use crate::router::{normalize_request_host, RouteTable};
use crate::websocket::{is_upgrade_request, proxy_upgrade};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info};

/// Body type for every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Proxy server
///
/// The certificate store and route table are fixed at construction and
/// shared read-only by every connection task.
pub struct ProxyServer {
    settings: ServerSettings,
    certificates: Arc<CertificateStore>,
    routes: Arc<RouteTable>,
    forwarder: HttpForwarder,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(settings: ServerSettings, certificates: CertificateStore, routes: RouteTable) -> Self {
        let forwarder = HttpForwarder::new(
            settings.connect_timeout,
            settings.backend_timeout,
            settings.pool_idle_timeout,
        );

        Self {
            settings,
            certificates: Arc::new(certificates),
            routes: Arc::new(routes),
            forwarder,
        }
    }

    /// Build a server from a validated configuration
    pub fn from_config(config: &ProxyConfig, source: &dyn CertificateSource) -> Result<Self, ConfigError> {
        config.validate()?;
        let routes = config.route_table()?;
        let certificates = config.certificate_store(source)?;

        Ok(Self::new(config.settings(), certificates, routes))
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Wrap an already bound socket in this server's TLS settings
    pub fn tls_listener(&self, listener: TcpListener) -> Result<TlsListener, ConfigError> {
        TlsListener::new(
            listener,
            self.certificates.clone(),
            &self.settings.next_protocols,
            self.settings.handshake_timeout,
        )
    }

    /// Bind the configured addresses and serve until the process exits
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TlsListener::bind(
            self.settings.listen,
            self.certificates.clone(),
            &self.settings.next_protocols,
            self.settings.handshake_timeout,
        )
        .await?;
        let https_port = listener.local_addr()?.port();

        if let Some(addr) = self.settings.redirect_listen {
            let redirect = TcpListener::bind(addr).await?;
            info!("HTTP redirect listener on {}", addr);
            tokio::spawn(run_redirect_server(redirect, https_port));
        }

        info!("Listening on {}...", listener.local_addr()?);
        self.serve(listener).await;

        Ok(())
    }

    /// Serve connections from a bound TLS listener
    pub async fn serve(self: Arc<Self>, listener: TlsListener) {
        listener
            .serve(move |stream, remote_addr| {
                let server = self.clone();
                async move { server.handle_connection(stream, remote_addr).await }
            })
            .await
    }

    /// Run HTTP/1.1 over one decrypted connection
    async fn handle_connection(self: Arc<Self>, stream: TlsStream<TcpStream>, remote_addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let server = self.clone();

        let result = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .with_upgrades()
            .await;

        if let Err(e) = result {
            debug!("Connection error from {}: {}", remote_addr, e);
        }
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        Ok(self.process_request(req, remote_addr).await)
    }

    /// Route a request and hand it to the matching backend
    async fn process_request(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let host = match original_host(req.headers(), req.uri()) {
            Some(h) => h,
            None => return error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        debug!("{} {}{} from {}", method, host, path, remote_addr);

        let rule = match self.routes.match_route(&host, &path) {
            Ok(rule) => rule,
            Err(e) => {
                debug!("{}", e);
                return error_response(StatusCode::NOT_FOUND, "Not Found");
            }
        };

        let result = if is_upgrade_request(&req) {
            proxy_upgrade(
                req,
                rule,
                remote_addr,
                self.settings.connect_timeout,
                self.settings.backend_timeout,
            )
            .await
        } else {
            self.forwarder.forward(req, &rule.backend, remote_addr).await
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "{} {}{} -> {} failed: {}",
                    method,
                    host,
                    path,
                    rule.backend.authority(),
                    e
                );
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

/// Answer every plain HTTP request with a redirect to HTTPS
async fn run_redirect_server(listener: TcpListener, https_port: u16) {
    loop {
        let (stream, remote_addr) = accept_with_backoff(|| listener.accept()).await;

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                Ok::<_, Infallible>(redirect_for(&req, https_port))
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Redirect connection error from {}: {}", remote_addr, e);
            }
        });
    }
}

fn redirect_for<B>(req: &Request<B>, https_port: u16) -> Response<ProxyBody> {
    let host = match original_host(req.headers(), req.uri()) {
        Some(h) => normalize_request_host(&h),
        None => return error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
    };

    let authority = if https_port == 443 {
        host
    } else {
        format!("{}:{}", host, https_port)
    };
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    redirect_response(&format!("https://{}{}", authority, path))
}

/// Create error response
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create redirect response
fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => error_response(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HOST;

    fn request(host: Option<&str>, uri: &str) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(h) = host {
            builder = builder.header(HOST, h);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_redirect_default_port() {
        let response = redirect_for(&request(Some("Board.Manabo.info:80"), "/boards?page=2"), 443);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "https://board.manabo.info/boards?page=2");
    }

    #[test]
    fn test_redirect_custom_port() {
        let response = redirect_for(&request(Some("manabo.info"), "/"), 8443);
        assert_eq!(response.headers()[LOCATION], "https://manabo.info:8443/");
    }

    #[test]
    fn test_redirect_without_host() {
        let response = redirect_for(&request(None, "/"), 443);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Bad Gateway");
    }
}
