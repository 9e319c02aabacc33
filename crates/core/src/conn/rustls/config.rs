//! TLS configuration for rustls-backed listeners.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::fs::File;
use std::future::{Ready, ready};
use std::io::{Error as IoError, Read, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use futures_util::stream::{Once, once};
use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
    DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme,
    SupportedProtocolVersion,
};

pub use tokio_rustls::rustls::server::ServerConfig;

use super::{read_trust_anchor, system_trust_anchor};
use crate::IntoVecString;
use crate::conn::IntoConfigStream;

/// Private key and certificate.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct Keycert {
    /// Private key.
    pub key: Vec<u8>,
    /// Certificate chain.
    pub cert: Vec<u8>,
    /// OCSP response.
    pub ocsp_resp: Vec<u8>,
}

impl Keycert {
    /// Create a new, empty keycert.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TLS private key from a file path.
    #[inline]
    pub fn key_from_path(mut self, path: impl AsRef<Path>) -> IoResult<Self> {
        let mut file = File::open(path.as_ref())?;
        file.read_to_end(&mut self.key)?;
        Ok(self)
    }

    /// Set the TLS private key from PEM bytes.
    #[inline]
    #[must_use]
    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the TLS certificate chain from a file path.
    #[inline]
    pub fn cert_from_path(mut self, path: impl AsRef<Path>) -> IoResult<Self> {
        let mut file = File::open(path)?;
        file.read_to_end(&mut self.cert)?;
        Ok(self)
    }

    /// Set the TLS certificate chain from PEM bytes.
    #[inline]
    #[must_use]
    pub fn cert(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.cert = cert.into();
        self
    }

    /// Set the OCSP response to staple.
    #[inline]
    #[must_use]
    pub fn ocsp_resp(mut self, ocsp_resp: impl Into<Vec<u8>>) -> Self {
        self.ocsp_resp = ocsp_resp.into();
        self
    }

    fn build_certified_key(&self) -> IoResult<CertifiedKey> {
        let cert = rustls_pemfile::certs(&mut self.cert.as_ref())
            .collect::<IoResult<Vec<CertificateDer<'static>>>>()
            .map_err(|_| IoError::other("failed to parse tls certificates"))?;
        if cert.is_empty() {
            return Err(IoError::other("no certificate found in chain"));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut self.key.as_ref())
            .map_err(|_| IoError::other("failed to parse tls private key"))?
            .ok_or_else(|| IoError::other("no private key found"))?;
        let key = any_supported_type(&key).map_err(|_| IoError::other("unsupported private key"))?;
        Ok(CertifiedKey {
            cert,
            key,
            ocsp: if self.ocsp_resp.is_empty() {
                None
            } else {
                Some(self.ocsp_resp.clone())
            },
        })
    }
}

/// Client certificate verification policy.
#[derive(Clone, Debug)]
pub enum ClientVerification {
    /// No client certificate requested.
    Disabled,
    /// Request a certificate but admit clients that present none.
    Optional {
        /// PEM trust roots; the platform trust store when `None`.
        trust_roots: Option<Vec<u8>>,
    },
    /// Require a certificate and validate its chain against the roots.
    /// There is no hostname to check on the server side.
    Required {
        /// PEM trust roots; the platform trust store when `None`.
        trust_roots: Option<Vec<u8>>,
    },
}

/// Outcome of a custom peer verification callback.
#[derive(Clone, Debug)]
pub enum Verdict {
    /// The chain is accepted.
    Verified(Vec<CertificateDer<'static>>),
    /// The chain is rejected, with a reason surfaced in the TLS alert.
    Failed(String),
}

/// Custom peer verification callback.
///
/// Receives the certificate chain the peer presented, end entity first.
/// When set, the callback replaces chain validation against the trust
/// roots; the handshake still performs its usual signature checks.
pub type ArcPeerVerifier =
    Arc<dyn Fn(&[CertificateDer<'static>]) -> Verdict + Send + Sync + 'static>;

fn default_alpn_protocols() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Builder for the rustls server configuration.
#[derive(Clone)]
pub struct RustlsConfig {
    /// Fallback keycert, used when no SNI keycert matches.
    pub fallback: Option<Keycert>,
    /// Keycerts by SNI name.
    pub keycerts: HashMap<Vec<String>, Keycert>,
    /// Client certificate policy.
    pub client_verification: ClientVerification,
    peer_verifier: Option<ArcPeerVerifier>,
    /// Protocols offered through ALPN, most preferred first.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Supported TLS versions.
    pub tls_versions: &'static [&'static SupportedProtocolVersion],
}

impl Debug for RustlsConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsConfig")
            .field("client_verification", &self.client_verification)
            .field("has_peer_verifier", &self.peer_verifier.is_some())
            .field("alpn_protocols", &self.alpn_protocols)
            .finish_non_exhaustive()
    }
}

impl RustlsConfig {
    /// Create a new `RustlsConfig` with the given fallback keycert.
    #[must_use]
    pub fn new(fallback: impl Into<Option<Keycert>>) -> Self {
        Self {
            fallback: fallback.into(),
            keycerts: HashMap::new(),
            client_verification: ClientVerification::Disabled,
            peer_verifier: None,
            alpn_protocols: default_alpn_protocols(),
            tls_versions: tokio_rustls::rustls::ALL_VERSIONS,
        }
    }

    /// Set the client certificate policy.
    #[inline]
    #[must_use]
    pub fn client_verification(mut self, policy: ClientVerification) -> Self {
        self.client_verification = policy;
        self
    }

    /// Install a custom peer verification callback.
    ///
    /// Only meaningful together with a non-disabled
    /// [`client_verification`](Self::client_verification) policy;
    /// [`build_server_config`](Self::build_server_config) rejects the
    /// combination otherwise.
    #[inline]
    #[must_use]
    pub fn peer_verifier(mut self, verifier: ArcPeerVerifier) -> Self {
        self.peer_verifier = Some(verifier);
        self
    }

    /// Add a keycert for the given SNI name(s). Wildcard names
    /// (`*.example.com`) match one level of subdomain.
    #[inline]
    #[must_use]
    pub fn keycert(mut self, name: impl IntoVecString, keycert: Keycert) -> Self {
        self.keycerts.insert(name.into_vec_string(), keycert);
        self
    }

    /// Set the protocols offered through ALPN.
    #[inline]
    #[must_use]
    pub fn alpn_protocols(mut self, alpn_protocols: impl Into<Vec<Vec<u8>>>) -> Self {
        self.alpn_protocols = alpn_protocols.into();
        self
    }

    /// Set the supported TLS versions.
    #[inline]
    #[must_use]
    pub fn tls_versions(
        mut self,
        tls_versions: &'static [&'static SupportedProtocolVersion],
    ) -> Self {
        self.tls_versions = tls_versions;
        self
    }

    fn client_cert_verifier(&self) -> IoResult<Arc<dyn ClientCertVerifier>> {
        let (trust_roots, mandatory) = match &self.client_verification {
            ClientVerification::Disabled => {
                if self.peer_verifier.is_some() {
                    return Err(IoError::other(
                        "custom verification callback requires client verification",
                    ));
                }
                return Ok(WebPkiClientVerifier::no_client_auth());
            }
            ClientVerification::Optional { trust_roots } => (trust_roots, false),
            ClientVerification::Required { trust_roots } => (trust_roots, true),
        };
        let roots = match trust_roots {
            Some(pem) => read_trust_anchor(pem)?,
            None => system_trust_anchor()?,
        };
        let builder = WebPkiClientVerifier::builder(roots.into());
        let builder = if mandatory {
            builder
        } else {
            builder.allow_unauthenticated()
        };
        let verifier = builder
            .build()
            .map_err(|e| IoError::other(format!("failed to build client verifier: {e}")))?;
        Ok(match &self.peer_verifier {
            Some(callback) => Arc::new(CallbackClientVerifier {
                inner: verifier,
                callback: Arc::clone(callback),
            }),
            None => verifier,
        })
    }

    /// Build the rustls [`ServerConfig`].
    pub fn build_server_config(self) -> IoResult<ServerConfig> {
        let fallback = self
            .fallback
            .as_ref()
            .map(Keycert::build_certified_key)
            .transpose()?
            .map(Arc::new);
        let mut exact_certified_keys = HashMap::new();
        let mut wildcard_certified_keys = HashMap::new();
        for (names, keycert) in &self.keycerts {
            let certified_key = Arc::new(keycert.build_certified_key()?);
            for name in names {
                if let Some(rest) = name.strip_prefix("*.") {
                    wildcard_certified_keys.insert(rest.to_owned(), certified_key.clone());
                } else {
                    exact_certified_keys.insert(name.clone(), certified_key.clone());
                }
            }
        }

        let client_verifier = self.client_cert_verifier()?;

        let mut config = ServerConfig::builder_with_protocol_versions(self.tls_versions)
            .with_client_cert_verifier(client_verifier)
            .with_cert_resolver(Arc::new(CertResolver {
                exact_certified_keys,
                wildcard_certified_keys,
                fallback,
            }));
        config.alpn_protocols = self.alpn_protocols;
        Ok(config)
    }
}

impl TryInto<ServerConfig> for RustlsConfig {
    type Error = IoError;

    fn try_into(self) -> IoResult<ServerConfig> {
        self.build_server_config()
    }
}

#[derive(Debug)]
struct CertResolver {
    fallback: Option<Arc<CertifiedKey>>,
    exact_certified_keys: HashMap<String, Arc<CertifiedKey>>,
    wildcard_certified_keys: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| {
                if let Some(certified_key) = self.exact_certified_keys.get(name) {
                    Some(Arc::clone(certified_key))
                } else {
                    name.split_once('.')
                        .and_then(|(_, rest)| self.wildcard_certified_keys.get(rest).cloned())
                }
            })
            .or_else(|| self.fallback.clone())
    }
}

/// Delegates everything but the chain decision to the webpki verifier.
struct CallbackClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    callback: ArcPeerVerifier,
}

impl Debug for CallbackClientVerifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackClientVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for CallbackClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|cert| cert.clone().into_owned()));
        match (self.callback)(&chain) {
            Verdict::Verified(_) => Ok(ClientCertVerified::assertion()),
            Verdict::Failed(reason) => Err(TlsError::General(reason)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

impl IntoConfigStream<Self> for RustlsConfig {
    type Stream = Once<Ready<Self>>;

    fn into_stream(self) -> Self::Stream {
        once(ready(self))
    }
}

impl<T> IntoConfigStream<RustlsConfig> for T
where
    T: Stream<Item = RustlsConfig> + Send + Unpin + 'static,
{
    type Stream = T;

    fn into_stream(self) -> Self {
        self
    }
}

/// Re-read key material from disk on an interval, yielding a fresh
/// configuration whenever the files parse.
///
/// `make` turns each re-read [`Keycert`] into a full configuration, so
/// client verification and ALPN settings survive the reload. Unreadable
/// files are logged and skipped; the previously accepted configuration
/// stays in effect.
pub fn reloading<F>(
    cert_path: impl Into<PathBuf>,
    key_path: impl Into<PathBuf>,
    refresh_interval: Duration,
    make: F,
) -> impl Stream<Item = RustlsConfig> + Send + Unpin + 'static
where
    F: Fn(Keycert) -> RustlsConfig + Send + 'static,
{
    struct ReloadState<F> {
        cert_path: PathBuf,
        key_path: PathBuf,
        refresh_interval: Duration,
        make: F,
        started: bool,
    }

    let state = ReloadState {
        cert_path: cert_path.into(),
        key_path: key_path.into(),
        refresh_interval,
        make,
        started: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.started {
                tokio::time::sleep(state.refresh_interval).await;
            }
            state.started = true;
            let keycert = Keycert::new()
                .cert_from_path(&state.cert_path)
                .and_then(|keycert| keycert.key_from_path(&state.key_path));
            match keycert {
                Ok(keycert) => {
                    let config = (state.make)(keycert);
                    return Some((config, state));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to reload tls key material");
                }
            }
        }
    }))
}
