//! Proxy configuration file
//!
//! A JSON document listing the listen address, certificates and routes. It is
//! read once at startup; nothing in it changes while serving.

use crate::certificate::{CertificateEntry, CertificateSource, CertificateStore, FileSource, MemorySource};
use crate::error::ConfigError;
use crate::router::{Backend, RouteTable, TargetKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// ALPN protocols offered during the handshake
    #[serde(default = "default_next_protocols")]
    pub next_protocols: Vec<String>,

    /// Plain HTTP listener that redirects everything to HTTPS
    #[serde(default)]
    pub redirect_listen: Option<SocketAddr>,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long to wait for backend response headers
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// The first certificate is the default for unknown server names
    pub certificates: Vec<CertificateConfig>,

    /// tar or tar.gz bundle to read certificate paths from instead of disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_archive: Option<PathBuf>,

    /// Evaluated in order; first match wins
    pub routes: Vec<RouteConfig>,
}

/// Certificate chain and key for one hostname or `*.suffix` wildcard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub hostname: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub host: String,
    pub path_prefix: String,
    #[serde(default = "default_kind")]
    pub kind: TargetKind,
    pub target: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_next_protocols() -> Vec<String> {
    vec!["http/1.1".to_string()]
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_backend_timeout() -> u64 {
    60
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_kind() -> TargetKind {
    TargetKind::Http
}

/// Timeouts and listener options, detached from the certificate/route data
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: SocketAddr,
    pub next_protocols: Vec<String>,
    pub redirect_listen: Option<SocketAddr>,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub backend_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            next_protocols: default_next_protocols(),
            redirect_listen: None,
            handshake_timeout: Duration::from_secs(default_handshake_timeout()),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            backend_timeout: Duration::from_secs(default_backend_timeout()),
            pool_idle_timeout: Duration::from_secs(default_pool_idle_timeout()),
        }
    }
}

impl ProxyConfig {
    /// Read and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_json(&contents)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without reading certificates
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.certificates.is_empty() {
            return Err(ConfigError::NoCertificates);
        }

        if self.next_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(ConfigError::InvalidProtocols(self.next_protocols.join(",")));
        }

        for cert in &self.certificates {
            if cert.hostname.trim().is_empty() {
                return Err(ConfigError::Certificate {
                    hostname: cert.hostname.clone(),
                    reason: "hostname is empty".to_string(),
                });
            }
        }

        self.route_table().map(|_| ())
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            listen: self.listen,
            next_protocols: self.next_protocols.clone(),
            redirect_listen: self.redirect_listen,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    /// Build the route table in file order
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut table = RouteTable::new();

        for route in &self.routes {
            let invalid = |reason: &str| ConfigError::InvalidRoute {
                host: route.host.clone(),
                path_prefix: route.path_prefix.clone(),
                reason: reason.to_string(),
            };

            if route.host.trim().is_empty() {
                return Err(invalid("host is empty"));
            }
            if !route.path_prefix.starts_with('/') {
                return Err(invalid("path prefix must start with '/'"));
            }

            let backend = Backend::new(route.kind, &route.target)?;
            table.add_rule(&route.host, &route.path_prefix, backend);
        }

        Ok(table)
    }

    /// Where certificate material comes from
    ///
    /// The archive when one is configured, otherwise the file system. Relative
    /// paths, including the archive's own, resolve against `base_dir`.
    pub fn certificate_source(&self, base_dir: &Path) -> Result<Box<dyn CertificateSource>, ConfigError> {
        match &self.certificate_archive {
            Some(archive) => {
                let path = base_dir.join(archive);
                let source = MemorySource::from_archive_file(&path).map_err(|e| ConfigError::Read {
                    path: path.clone(),
                    source: e,
                })?;
                info!("Read {} file(s) from certificate archive {}", source.len(), path.display());
                Ok(Box::new(source))
            }
            None => Ok(Box::new(FileSource::with_base_dir(base_dir))),
        }
    }

    /// Read every certificate through `source` and load the store
    pub fn certificate_store(&self, source: &dyn CertificateSource) -> Result<CertificateStore, ConfigError> {
        let entries = self
            .certificates
            .iter()
            .map(|c| CertificateEntry::read(&c.hostname, &c.cert, &c.key, source))
            .collect::<Result<Vec<_>, _>>()?;

        CertificateStore::load(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::MemorySource;
    use tempfile::tempdir;

    const BOARD_CONFIG: &str = r#"{
        "certificates": [
            { "hostname": "manabo.info", "cert": "ssl/manabo-info/fullchain.pem", "key": "ssl/manabo-info/privkey.pem" },
            { "hostname": "board.manabo.info", "cert": "ssl/board-manabo-info/fullchain.pem", "key": "ssl/board-manabo-info/privkey.pem" }
        ],
        "routes": [
            { "host": "manabo.info", "path_prefix": "/", "target": "http://127.0.0.1:3000" },
            { "host": "board.manabo.info", "path_prefix": "/socket.io/1/websocket/", "kind": "websocket", "target": "ws://127.0.0.1:8080" },
            { "host": "board.manabo.info", "path_prefix": "/socket.io/", "target": "http://127.0.0.1:8080" },
            { "host": "board.manabo.info", "path_prefix": "/", "target": "http://127.0.0.1:3001" }
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_json(BOARD_CONFIG).unwrap();

        assert_eq!(config.listen, "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.next_protocols, vec!["http/1.1"]);
        assert!(config.redirect_listen.is_none());

        let settings = config.settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.backend_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_route_table_keeps_file_order() {
        let config = ProxyConfig::from_json(BOARD_CONFIG).unwrap();
        let table = config.route_table().unwrap();

        let prefixes: Vec<&str> = table.rules().iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/", "/socket.io/1/websocket/", "/socket.io/", "/"]);
        assert_eq!(table.rules()[1].backend.kind(), TargetKind::WebSocket);
    }

    #[test]
    fn test_overrides() {
        let json = r#"{
            "listen": "127.0.0.1:8443",
            "redirect_listen": "127.0.0.1:8080",
            "next_protocols": ["http/1.1", "acme-tls/1"],
            "connect_timeout_secs": 2,
            "certificates": [{ "hostname": "a.test", "cert": "a.pem", "key": "a.key" }],
            "routes": []
        }"#;
        let config = ProxyConfig::from_json(json).unwrap();

        assert_eq!(config.listen.port(), 8443);
        assert_eq!(config.redirect_listen.map(|a| a.port()), Some(8080));
        assert_eq!(config.next_protocols.len(), 2);
        assert_eq!(config.settings().connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_missing_certificates() {
        let json = r#"{ "certificates": [], "routes": [] }"#;
        assert!(matches!(ProxyConfig::from_json(json), Err(ConfigError::NoCertificates)));
    }

    #[test]
    fn test_rejects_bad_routes() {
        let bad_prefix = r#"{
            "certificates": [{ "hostname": "a.test", "cert": "a.pem", "key": "a.key" }],
            "routes": [{ "host": "a.test", "path_prefix": "api", "target": "http://127.0.0.1:1" }]
        }"#;
        assert!(matches!(ProxyConfig::from_json(bad_prefix), Err(ConfigError::InvalidRoute { .. })));

        let bad_target = r#"{
            "certificates": [{ "hostname": "a.test", "cert": "a.pem", "key": "a.key" }],
            "routes": [{ "host": "a.test", "path_prefix": "/", "target": "https://127.0.0.1:1" }]
        }"#;
        assert!(matches!(ProxyConfig::from_json(bad_target), Err(ConfigError::InvalidBackend { .. })));

        let bad_kind = r#"{
            "certificates": [{ "hostname": "a.test", "cert": "a.pem", "key": "a.key" }],
            "routes": [{ "host": "a.test", "path_prefix": "/", "kind": "grpc", "target": "http://127.0.0.1:1" }]
        }"#;
        assert!(matches!(ProxyConfig::from_json(bad_kind), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_empty_protocol() {
        let json = r#"{
            "next_protocols": [""],
            "certificates": [{ "hostname": "a.test", "cert": "a.pem", "key": "a.key" }],
            "routes": []
        }"#;
        assert!(matches!(ProxyConfig::from_json(json), Err(ConfigError::InvalidProtocols(_))));
    }

    #[test]
    fn test_from_file_and_certificate_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sniproxy.json");
        fs::write(&path, BOARD_CONFIG).unwrap();

        let config = ProxyConfig::from_file(&path).unwrap();

        let mut source = MemorySource::new();
        for cert in &config.certificates {
            let generated = rcgen::generate_simple_self_signed(vec![cert.hostname.clone()]).unwrap();
            source.insert(cert.cert.clone(), generated.cert.pem());
            source.insert(cert.key.clone(), generated.key_pair.serialize_pem());
        }

        let store = config.certificate_store(&source).unwrap();
        let names: Vec<&str> = store.hostnames().collect();
        assert_eq!(names, vec!["manabo.info", "board.manabo.info"]);
    }

    #[test]
    fn test_missing_certificate_file() {
        let config = ProxyConfig::from_json(BOARD_CONFIG).unwrap();
        let err = config.certificate_store(&MemorySource::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_from_file_missing() {
        let err = ProxyConfig::from_file("/nonexistent/sniproxy.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_certificate_archive_source() {
        let dir = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        for (hostname, dir_name) in [("manabo.info", "manabo-info"), ("board.manabo.info", "board-manabo-info")] {
            let generated = rcgen::generate_simple_self_signed(vec![hostname.to_string()]).unwrap();
            for (file, contents) in [("fullchain.pem", generated.cert.pem()), ("privkey.pem", generated.key_pair.serialize_pem())] {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o600);
                builder
                    .append_data(&mut header, format!("ssl/{}/{}", dir_name, file), contents.as_bytes())
                    .unwrap();
            }
        }
        fs::write(dir.path().join("certs.tar"), builder.into_inner().unwrap()).unwrap();

        let mut config = ProxyConfig::from_json(BOARD_CONFIG).unwrap();

        // Nothing on disk under ssl/, so only the archive can satisfy the paths
        let from_disk = config.certificate_source(dir.path()).unwrap();
        assert!(config.certificate_store(from_disk.as_ref()).is_err());

        config.certificate_archive = Some(PathBuf::from("certs.tar"));
        let from_archive = config.certificate_source(dir.path()).unwrap();
        let store = config.certificate_store(from_archive.as_ref()).unwrap();
        assert_eq!(store.len(), 2);

        config.certificate_archive = Some(PathBuf::from("missing.tar"));
        assert!(matches!(config.certificate_source(dir.path()), Err(ConfigError::Read { .. })));
    }
}
