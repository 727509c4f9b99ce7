//! Certificate store for SNI-based certificate selection
//! Loads PEM certificate/key pairs once at startup and resolves them per handshake

use crate::error::{ConfigError, NoCertificateError};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Read access to certificate and key material
///
/// The store never touches storage itself; callers decide whether bytes come
/// from disk, from an archive bundled with the binary, or elsewhere.
pub trait CertificateSource: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Reads material from the file system
///
/// Relative paths are resolved against `base_dir` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    base_dir: Option<PathBuf>,
}

impl FileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `base_dir`
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.as_ref().to_path_buf()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl CertificateSource for FileSource {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }
}

/// In-memory archive of material keyed by path
///
/// Used for material embedded in the binary (`include_bytes!`) or unpacked
/// from a tar archive shipped next to it. Lookups ignore `./` components, so
/// `ssl/a.pem` and `./ssl/a.pem` name the same file.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<P: Into<PathBuf>>(&mut self, path: P, contents: impl Into<Vec<u8>>) {
        self.files.insert(archive_path(&path.into()), contents.into());
    }

    pub fn with_file<P: Into<PathBuf>>(mut self, path: P, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    /// Load every regular file of a tar stream
    ///
    /// Entries whose path climbs out of the archive root are skipped.
    pub fn from_tar<R: Read>(reader: R) -> io::Result<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut source = Self::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path()?.into_owned();
            if path.components().any(|c| c == Component::ParentDir) {
                warn!("Skipping archive entry {}", path.display());
                continue;
            }

            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            debug!("Archive entry {} ({} bytes)", path.display(), contents.len());
            source.insert(path, contents);
        }

        Ok(source)
    }

    /// Open a `.tar` or gzip-compressed tar file
    pub fn from_archive_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        if reader.fill_buf()?.starts_with(&[0x1f, 0x8b]) {
            Self::from_tar(GzDecoder::new(reader))
        } else {
            Self::from_tar(reader)
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn archive_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

impl CertificateSource for MemorySource {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files.get(&archive_path(path)).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not present in archive", path.display()),
            )
        })
    }
}

/// A hostname (or `*.suffix` wildcard) with its PEM chain and key
#[derive(Clone)]
pub struct CertificateEntry {
    pub hostname: String,
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl CertificateEntry {
    pub fn new(
        hostname: impl Into<String>,
        certificate: impl Into<Vec<u8>>,
        private_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }

    /// Read an entry's chain and key through `source`
    pub fn read(
        hostname: &str,
        cert_path: &Path,
        key_path: &Path,
        source: &dyn CertificateSource,
    ) -> Result<Self, ConfigError> {
        let certificate = source.read(cert_path).map_err(|e| ConfigError::Read {
            path: cert_path.to_path_buf(),
            source: e,
        })?;
        let private_key = source.read(key_path).map_err(|e| ConfigError::Read {
            path: key_path.to_path_buf(),
            source: e,
        })?;

        Ok(Self::new(hostname, certificate, private_key))
    }
}

impl std::fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("hostname", &self.hostname)
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Hostname-indexed set of certificates, read-only after `load`
#[derive(Debug)]
pub struct CertificateStore {
    /// Load order; the first entry is the default certificate
    certificates: Vec<(String, Arc<CertifiedKey>)>,
    exact: HashMap<String, usize>,
    /// `*.example.com` is stored under `example.com`
    wildcard: HashMap<String, usize>,
}

impl CertificateStore {
    /// Parse and verify every entry, then build the name index
    ///
    /// Any unparseable material, or a key that does not belong to its leaf
    /// certificate, fails the whole load.
    pub fn load(entries: Vec<CertificateEntry>) -> Result<Self, ConfigError> {
        let provider = rustls::crypto::ring::default_provider();

        let mut certificates = Vec::with_capacity(entries.len());
        let mut exact = HashMap::new();
        let mut wildcard = HashMap::new();

        for entry in entries {
            let key = Self::certified_key(&entry, &provider)?;
            let name = normalize_hostname(&entry.hostname);
            let index = certificates.len();

            let slot = match name.strip_prefix("*.") {
                Some(suffix) => wildcard.entry(suffix.to_string()),
                None => exact.entry(name.clone()),
            };
            slot.or_insert(index);

            debug!("Loaded certificate for {}", name);
            certificates.push((name, Arc::new(key)));
        }

        info!("Certificate store ready with {} certificate(s)", certificates.len());

        Ok(Self {
            certificates,
            exact,
            wildcard,
        })
    }

    fn certified_key(
        entry: &CertificateEntry,
        provider: &CryptoProvider,
    ) -> Result<CertifiedKey, ConfigError> {
        let invalid = |reason: String| ConfigError::Certificate {
            hostname: entry.hostname.clone(),
            reason,
        };

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut entry.certificate.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| invalid(format!("unreadable certificate PEM: {}", e)))?;

        if chain.is_empty() {
            return Err(invalid("no certificate found in PEM data".to_string()));
        }

        let key = rustls_pemfile::private_key(&mut entry.private_key.as_slice())
            .map_err(|e| invalid(format!("unreadable private key PEM: {}", e)))?
            .ok_or_else(|| invalid("no private key found in PEM data".to_string()))?;

        let signing_key = provider
            .key_provider
            .load_private_key(key)
            .map_err(|e| invalid(format!("unsupported private key: {}", e)))?;

        let certified = CertifiedKey::new(chain, signing_key);
        certified.keys_match().map_err(|_| ConfigError::KeyMismatch {
            hostname: entry.hostname.clone(),
        })?;

        Ok(certified)
    }

    /// Pick the certificate for a ClientHello server name
    ///
    /// Exact match first, then a single-level wildcard (`*.example.com`
    /// covers `a.example.com` but not `a.b.example.com`), then the first
    /// loaded certificate.
    pub fn select(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, NoCertificateError> {
        if let Some(name) = server_name {
            let name = normalize_hostname(name);

            if let Some(&index) = self.exact.get(&name) {
                return Ok(self.certificates[index].1.clone());
            }

            if let Some((label, parent)) = name.split_once('.') {
                if !label.is_empty() {
                    if let Some(&index) = self.wildcard.get(parent) {
                        return Ok(self.certificates[index].1.clone());
                    }
                }
            }
        }

        self.certificates
            .first()
            .map(|(_, key)| key.clone())
            .ok_or_else(|| NoCertificateError {
                server_name: server_name.map(str::to_string),
            })
    }

    /// Configured hostnames, in load order
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.certificates.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        match self.select(server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }
}

/// Lower-case and drop a trailing root dot
pub(crate) fn normalize_hostname(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
