//! Host and path-prefix routing
//! Rules are checked in registration order and the first match wins

use crate::certificate::normalize_hostname;
use crate::error::{ConfigError, RouteError};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How a backend expects to be spoken to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    #[serde(alias = "ws")]
    WebSocket,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Http => f.pad("http"),
            TargetKind::WebSocket => f.pad("websocket"),
        }
    }
}

/// A single backend service reached over plain HTTP/1.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    kind: TargetKind,
    url: Url,
    authority: String,
}

impl Backend {
    /// Validate a target URL
    ///
    /// `http://` and `ws://` targets are accepted; TLS to backends is not
    /// supported.
    pub fn new(kind: TargetKind, target: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            target: target.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "http" | "ws" => {}
            "https" | "wss" => return Err(invalid("TLS backends are not supported")),
            _ => return Err(invalid("scheme must be http or ws")),
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h,
            _ => return Err(invalid("missing host")),
        };
        let port = url.port().unwrap_or(80);
        let authority = format!("{}:{}", host, port);

        Ok(Self { kind, url, authority })
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` used for dialing and the forwarded `Host` header
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Origin-form request target for a client path and query
    ///
    /// The backend's base path is joined with a single slash and the two
    /// query strings are concatenated.
    pub fn request_target(&self, path: &str, query: Option<&str>) -> String {
        let mut target = join_paths(self.url.path(), path);

        let query = match (self.url.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(q)) => Some(format!("{}&{}", base, q)),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(q)) => Some(q.to_string()),
            (None, None) => None,
        };

        if let Some(q) = query {
            target.push('?');
            target.push_str(&q);
        }

        target
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Host + path-prefix association with a backend
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub host: String,
    pub path_prefix: String,
    pub backend: Backend,
}

impl RouteRule {
    fn matches(&self, host: &str, path: &str) -> bool {
        self.host == host && path.starts_with(&self.path_prefix)
    }
}

/// Ordered rule list, read-only once serving starts
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule
    ///
    /// Register longer prefixes first when they share a host with a shorter
    /// one, e.g. `/socket.io/1/websocket/` before `/socket.io/` before `/`.
    pub fn add_rule(&mut self, host: &str, path_prefix: &str, backend: Backend) {
        self.rules.push(RouteRule {
            host: normalize_hostname(host),
            path_prefix: path_prefix.to_string(),
            backend,
        });
    }

    /// First rule whose host equals `host` and whose prefix starts `path`
    pub fn match_route(&self, host: &str, path: &str) -> Result<&RouteRule, RouteError> {
        let host = normalize_request_host(host);

        self.rules
            .iter()
            .find(|rule| rule.matches(&host, path))
            .ok_or_else(|| RouteError::NoRoute {
                host,
                path: path.to_string(),
            })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Strip the port from a `Host` header value and normalize the name
///
/// Bracketed IPv6 literals keep their brackets.
pub fn normalize_request_host(host: &str) -> String {
    let host = host.trim();

    let name = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    normalize_hostname(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(target: &str) -> Backend {
        Backend::new(TargetKind::Http, target).unwrap()
    }

    fn board_table() -> RouteTable {
        let mut table = RouteTable::new();
        table.add_rule("manabo.info", "/", http("http://127.0.0.1:3000"));
        table.add_rule(
            "board.manabo.info",
            "/socket.io/1/websocket/",
            Backend::new(TargetKind::WebSocket, "ws://127.0.0.1:8080").unwrap(),
        );
        table.add_rule("board.manabo.info", "/socket.io/", http("http://127.0.0.1:8080"));
        table.add_rule("board.manabo.info", "/", http("http://127.0.0.1:3001"));
        table
    }

    #[test]
    fn test_first_match_wins() {
        let table = board_table();

        let rule = table.match_route("board.manabo.info", "/socket.io/1/websocket/abc").unwrap();
        assert_eq!(rule.backend.kind(), TargetKind::WebSocket);
        assert_eq!(rule.backend.authority(), "127.0.0.1:8080");

        let rule = table.match_route("board.manabo.info", "/socket.io/1/xhr-polling/abc").unwrap();
        assert_eq!(rule.backend.kind(), TargetKind::Http);
        assert_eq!(rule.path_prefix, "/socket.io/");

        let rule = table.match_route("board.manabo.info", "/boards/1").unwrap();
        assert_eq!(rule.backend.authority(), "127.0.0.1:3001");

        let rule = table.match_route("manabo.info", "/socket.io/").unwrap();
        assert_eq!(rule.backend.authority(), "127.0.0.1:3000");
    }

    #[test]
    fn test_registration_order_beats_specificity() {
        let mut table = RouteTable::new();
        table.add_rule("example.com", "/", http("http://127.0.0.1:1"));
        table.add_rule("example.com", "/api/", http("http://127.0.0.1:2"));

        let rule = table.match_route("example.com", "/api/users").unwrap();
        assert_eq!(rule.backend.authority(), "127.0.0.1:1");
    }

    #[test]
    fn test_host_match_is_case_insensitive_and_ignores_port() {
        let table = board_table();

        let rule = table.match_route("Board.Manabo.Info:443", "/").unwrap();
        assert_eq!(rule.host, "board.manabo.info");
    }

    #[test]
    fn test_no_route() {
        let table = board_table();

        let err = table.match_route("unknown.example.com", "/").unwrap_err();
        let RouteError::NoRoute { host, path } = err;
        assert_eq!(host, "unknown.example.com");
        assert_eq!(path, "/");

        assert!(table.match_route("manabo.info", "").is_err());
    }

    #[test]
    fn test_prefix_is_literal() {
        let mut table = RouteTable::new();
        table.add_rule("example.com", "/api", http("http://127.0.0.1:1"));

        assert!(table.match_route("example.com", "/apiary").is_ok());
        assert!(table.match_route("example.com", "/ap").is_err());
    }

    #[test]
    fn test_normalize_request_host() {
        assert_eq!(normalize_request_host("Example.COM:8443"), "example.com");
        assert_eq!(normalize_request_host("example.com."), "example.com");
        assert_eq!(normalize_request_host("[::1]:443"), "[::1]");
        assert_eq!(normalize_request_host("[::1]"), "[::1]");
    }

    #[test]
    fn test_backend_validation() {
        assert_eq!(http("http://127.0.0.1").authority(), "127.0.0.1:80");
        assert_eq!(
            Backend::new(TargetKind::WebSocket, "ws://localhost:8080").unwrap().authority(),
            "localhost:8080"
        );

        for bad in ["https://127.0.0.1", "wss://127.0.0.1", "ftp://127.0.0.1", "not a url", "http://"] {
            assert!(
                matches!(Backend::new(TargetKind::Http, bad), Err(ConfigError::InvalidBackend { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_request_target() {
        let plain = http("http://127.0.0.1:3000");
        assert_eq!(plain.request_target("/users", None), "/users");
        assert_eq!(plain.request_target("/users", Some("id=1")), "/users?id=1");

        let based = http("http://127.0.0.1:3000/app/?v=2");
        assert_eq!(based.request_target("/users", Some("id=1")), "/app/users?v=2&id=1");
        assert_eq!(based.request_target("/", None), "/app/?v=2");

        let no_slash = http("http://127.0.0.1:3000/app");
        assert_eq!(no_slash.request_target("/users", Some("")), "/app/users");
    }
}
