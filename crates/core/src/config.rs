//! Server configuration model.
//!
//! A serde mirror of the `httpServer.*` configuration keys. Loading the
//! values from a file or environment is the job of whatever configuration
//! layer embeds this crate; this module only models the keys, applies the
//! documented defaults and range clamps, and resolves a validated model
//! into a bound acceptor.
//!
//! Configuration is immutable once the server is constructed from it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::conn::{BoxAcceptor, Listener, TcpListener};

/// Invalid server configuration.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A custom peer verification callback only makes sense with mutual
    /// TLS.
    #[error("custom verification callback provided when not using mTLS")]
    CustomVerifierWithoutMtls,
    /// Backpressure watermarks out of order.
    #[error("backpressure watermarks must satisfy low <= high (low {low}, high {high})")]
    InvalidWatermarks {
        /// Configured low watermark.
        low: usize,
        /// Configured high watermark.
        high: usize,
    },
    /// A TLS mode was selected without usable key material.
    #[error("transport security requires both a certificate chain and a private key")]
    MissingKeyMaterial,
    /// A reloading TLS mode needs file paths to reload from.
    #[error("reloading transport security requires certificate and key file paths")]
    ReloadRequiresPaths,
}

/// Top-level server settings (`httpServer.*`).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Address to bind.
    pub bind_target: BindTarget,
    /// Transport security mode.
    #[serde(default)]
    pub transport_security: TransportSecurity,
    /// Backpressure watermarks for the per-connection channels.
    #[serde(default)]
    pub backpressure_strategy: BackpressureStrategy,
    /// HTTP/2 tunables.
    #[serde(default)]
    pub http2: Http2Settings,
}

/// Bind address.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindTarget {
    /// Host name or address to bind.
    pub host: String,
    /// Port to bind; `0` asks the system for a free port.
    pub port: u16,
}

/// Transport security mode, tagged by the `security` key.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "security")]
pub enum TransportSecurity {
    /// Plaintext TCP; HTTP/1.1 only.
    #[default]
    #[serde(rename = "plaintext")]
    Plaintext,
    /// TLS with a static key and chain.
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    #[serde(rename = "tls")]
    Tls(TlsSettings),
    /// TLS with key material re-read from disk on an interval.
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    #[serde(rename = "reloadingTLS")]
    ReloadingTls(TlsSettings),
    /// Mutual TLS.
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    #[serde(rename = "mTLS")]
    Mtls(MtlsSettings),
    /// Mutual TLS with reloading key material.
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    #[serde(rename = "reloadingMTLS")]
    ReloadingMtls(MtlsSettings),
}

fn default_refresh_interval() -> u64 {
    30
}

/// Key material for the TLS modes: either inline PEM strings or file paths.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TlsSettings {
    /// Certificate chain as a PEM string.
    #[serde(rename = "certificateChainPEMString", default)]
    pub certificate_chain_pem_string: Option<String>,
    /// Private key as a PEM string.
    #[serde(rename = "privateKeyPEMString", default)]
    pub private_key_pem_string: Option<String>,
    /// Path to the certificate chain PEM file.
    #[serde(rename = "certificateChainPEMPath", default)]
    pub certificate_chain_pem_path: Option<PathBuf>,
    /// Path to the private key PEM file.
    #[serde(rename = "privateKeyPEMPath", default)]
    pub private_key_pem_path: Option<PathBuf>,
    /// Seconds between reloads, for the reloading modes.
    #[serde(rename = "refreshInterval", default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl TlsSettings {
    cfg_feature! {
        #![feature = "rustls"]
        fn keycert(&self) -> Result<crate::conn::rustls::Keycert, ConfigError> {
            use crate::conn::rustls::Keycert;

            let keycert = match (&self.certificate_chain_pem_string, &self.private_key_pem_string) {
                (Some(cert), Some(key)) => {
                    Keycert::new().cert(cert.as_bytes()).key(key.as_bytes())
                }
                _ => match (&self.certificate_chain_pem_path, &self.private_key_pem_path) {
                    (Some(cert_path), Some(key_path)) => Keycert::new()
                        .cert_from_path(cert_path)
                        .and_then(|keycert| keycert.key_from_path(key_path))
                        .map_err(|_| ConfigError::MissingKeyMaterial)?,
                    _ => return Err(ConfigError::MissingKeyMaterial),
                },
            };
            Ok(keycert)
        }

        fn reload_paths(&self) -> Result<(PathBuf, PathBuf), ConfigError> {
            match (&self.certificate_chain_pem_path, &self.private_key_pem_path) {
                (Some(cert_path), Some(key_path)) => {
                    Ok((cert_path.clone(), key_path.clone()))
                }
                _ => Err(ConfigError::ReloadRequiresPaths),
            }
        }
    }

    /// The reload interval as a duration.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

/// Mutual-TLS extras on top of [`TlsSettings`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MtlsSettings {
    /// Key material.
    #[serde(flatten)]
    pub tls: TlsSettings,
    /// Trust roots as PEM strings; the platform trust store when absent.
    #[serde(rename = "trustRoots", default)]
    pub trust_roots: Option<Vec<String>>,
    /// How strictly the peer certificate is verified.
    #[serde(rename = "certificateVerificationMode", default)]
    pub certificate_verification_mode: CertificateVerificationMode,
}

impl MtlsSettings {
    cfg_feature! {
        #![feature = "rustls"]
        fn client_verification(&self) -> crate::conn::rustls::ClientVerification {
            use crate::conn::rustls::ClientVerification;

            let trust_roots = self
                .trust_roots
                .as_ref()
                .map(|roots| roots.join("\n").into_bytes());
            match self.certificate_verification_mode {
                CertificateVerificationMode::OptionalVerification => {
                    ClientVerification::Optional { trust_roots }
                }
                CertificateVerificationMode::NoHostnameVerification => {
                    ClientVerification::Required { trust_roots }
                }
            }
        }
    }
}

/// Peer verification strictness for mutual TLS.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub enum CertificateVerificationMode {
    /// Request a certificate but admit peers without one.
    #[default]
    #[serde(rename = "optionalVerification")]
    OptionalVerification,
    /// Require a certificate; no hostname check is applied.
    #[serde(rename = "noHostnameVerification")]
    NoHostnameVerification,
}

fn default_low() -> usize {
    2
}
fn default_high() -> usize {
    10
}

/// Low/high watermarks bounding the in-flight elements of a channel.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureStrategy {
    /// Producers resume once the backlog drains to this depth.
    #[serde(default = "default_low")]
    pub low: usize,
    /// Producers stall once the backlog reaches this depth.
    #[serde(default = "default_high")]
    pub high: usize,
}

impl Default for BackpressureStrategy {
    fn default() -> Self {
        Self {
            low: default_low(),
            high: default_high(),
        }
    }
}

impl BackpressureStrategy {
    /// Check the `low <= high` invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low > self.high {
            return Err(ConfigError::InvalidWatermarks {
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }
}

const H2_MIN_FRAME_SIZE: u32 = 1 << 14;
const H2_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
const H2_MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

fn default_max_frame_size() -> u32 {
    H2_MIN_FRAME_SIZE
}
fn default_target_window_size() -> u32 {
    (1 << 16) - 1
}

/// HTTP/2 tunables handed to the codec.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct Http2Settings {
    /// `SETTINGS_MAX_FRAME_SIZE`.
    #[serde(rename = "maxFrameSize", default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Initial flow-control window for each stream.
    #[serde(rename = "targetWindowSize", default = "default_target_window_size")]
    pub target_window_size: u32,
    /// `SETTINGS_MAX_CONCURRENT_STREAMS`; unlimited when absent.
    #[serde(rename = "maxConcurrentStreams", default)]
    pub max_concurrent_streams: Option<u32>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            target_window_size: default_target_window_size(),
            max_concurrent_streams: None,
        }
    }
}

impl Http2Settings {
    /// The tunables clamped to their protocol ranges: frame size into
    /// `[2^14, 2^24 - 1]`, window size into `[0, 2^31 - 1]`.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            max_frame_size: self.max_frame_size.clamp(H2_MIN_FRAME_SIZE, H2_MAX_FRAME_SIZE),
            target_window_size: self.target_window_size.min(H2_MAX_WINDOW_SIZE),
            max_concurrent_streams: self.max_concurrent_streams,
        }
    }
}

impl ServerSettings {
    /// Resolve the settings into a bound acceptor.
    pub async fn into_acceptor(self) -> crate::Result<BoxAcceptor> {
        self.resolve(None).await
    }

    cfg_feature! {
        #![feature = "rustls"]
        /// Resolve the settings into a bound acceptor, installing a custom
        /// peer verification callback.
        ///
        /// Only the mutual-TLS modes accept a callback; any other mode is
        /// rejected with [`ConfigError::CustomVerifierWithoutMtls`].
        pub async fn into_acceptor_with_verifier(
            self,
            verifier: crate::conn::rustls::ArcPeerVerifier,
        ) -> crate::Result<BoxAcceptor> {
            self.resolve(Some(verifier)).await
        }
    }

    #[cfg(not(feature = "rustls"))]
    async fn resolve(self, _verifier: Option<std::convert::Infallible>) -> crate::Result<BoxAcceptor> {
        self.backpressure_strategy.validate()?;
        let TransportSecurity::Plaintext = self.transport_security;
        let addr = (self.bind_target.host.clone(), self.bind_target.port);
        Ok(BoxAcceptor::new(TcpListener::new(addr).try_bind().await?))
    }

    #[cfg(feature = "rustls")]
    async fn resolve(
        self,
        verifier: Option<crate::conn::rustls::ArcPeerVerifier>,
    ) -> crate::Result<BoxAcceptor> {
        use crate::conn::rustls::{RustlsConfig, RustlsListener, reloading};

        self.backpressure_strategy.validate()?;
        let addr = (self.bind_target.host.clone(), self.bind_target.port);
        let tcp = TcpListener::new(addr);
        match self.transport_security {
            TransportSecurity::Plaintext => {
                if verifier.is_some() {
                    return Err(ConfigError::CustomVerifierWithoutMtls.into());
                }
                Ok(BoxAcceptor::new(tcp.try_bind().await?))
            }
            TransportSecurity::Tls(tls) => {
                if verifier.is_some() {
                    return Err(ConfigError::CustomVerifierWithoutMtls.into());
                }
                let config = RustlsConfig::new(tls.keycert()?);
                Ok(BoxAcceptor::new(
                    RustlsListener::new(config, tcp).try_bind().await?,
                ))
            }
            TransportSecurity::ReloadingTls(tls) => {
                if verifier.is_some() {
                    return Err(ConfigError::CustomVerifierWithoutMtls.into());
                }
                let (cert_path, key_path) = tls.reload_paths()?;
                let stream = reloading(
                    cert_path,
                    key_path,
                    tls.refresh_interval(),
                    RustlsConfig::new,
                );
                Ok(BoxAcceptor::new(
                    RustlsListener::new(stream, tcp).try_bind().await?,
                ))
            }
            TransportSecurity::Mtls(mtls) => {
                let mut config = RustlsConfig::new(mtls.tls.keycert()?)
                    .client_verification(mtls.client_verification());
                if let Some(verifier) = verifier {
                    config = config.peer_verifier(verifier);
                }
                Ok(BoxAcceptor::new(
                    RustlsListener::new(config, tcp).try_bind().await?,
                ))
            }
            TransportSecurity::ReloadingMtls(mtls) => {
                let (cert_path, key_path) = mtls.tls.reload_paths()?;
                let client_verification = mtls.client_verification();
                let stream = reloading(
                    cert_path,
                    key_path,
                    mtls.tls.refresh_interval(),
                    move |keycert| {
                        let mut config = RustlsConfig::new(keycert)
                            .client_verification(client_verification.clone());
                        if let Some(verifier) = &verifier {
                            config = config.peer_verifier(verifier.clone());
                        }
                        config
                    },
                );
                Ok(BoxAcceptor::new(
                    RustlsListener::new(stream, tcp).try_bind().await?,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let strategy = BackpressureStrategy::default();
        assert_eq!(strategy.low, 2);
        assert_eq!(strategy.high, 10);
        strategy.validate().unwrap();

        let http2 = Http2Settings::default();
        assert_eq!(http2.max_frame_size, 16_384);
        assert_eq!(http2.target_window_size, 65_535);
        assert_eq!(http2.max_concurrent_streams, None);
    }

    #[test]
    fn test_watermark_validation() {
        let strategy = BackpressureStrategy { low: 11, high: 10 };
        assert_eq!(
            strategy.validate(),
            Err(ConfigError::InvalidWatermarks { low: 11, high: 10 })
        );
    }

    #[test]
    fn test_http2_clamping() {
        let clamped = Http2Settings {
            max_frame_size: 1,
            target_window_size: u32::MAX,
            max_concurrent_streams: Some(7),
        }
        .clamped();
        assert_eq!(clamped.max_frame_size, 16_384);
        assert_eq!(clamped.target_window_size, (1 << 31) - 1);
        assert_eq!(clamped.max_concurrent_streams, Some(7));

        let clamped = Http2Settings {
            max_frame_size: 1 << 25,
            ..Http2Settings::default()
        }
        .clamped();
        assert_eq!(clamped.max_frame_size, (1 << 24) - 1);
    }

    #[test]
    fn test_parse_plaintext_settings() {
        let settings: ServerSettings = serde_json::from_str(
            r#"{
                "bindTarget": {"host": "127.0.0.1", "port": 8080},
                "backpressureStrategy": {"low": 1, "high": 4},
                "http2": {"maxFrameSize": 32768}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.bind_target.port, 8080);
        assert!(matches!(
            settings.transport_security,
            TransportSecurity::Plaintext
        ));
        assert_eq!(settings.backpressure_strategy.low, 1);
        assert_eq!(settings.http2.max_frame_size, 32_768);
        assert_eq!(settings.http2.target_window_size, 65_535);
    }

    #[cfg(feature = "rustls")]
    #[test]
    fn test_parse_mtls_settings() {
        let settings: ServerSettings = serde_json::from_str(
            r#"{
                "bindTarget": {"host": "::1", "port": 443},
                "transportSecurity": {
                    "security": "mTLS",
                    "certificateChainPEMPath": "certs/cert.pem",
                    "privateKeyPEMPath": "certs/key.pem",
                    "trustRoots": ["-----BEGIN CERTIFICATE-----"],
                    "certificateVerificationMode": "noHostnameVerification"
                }
            }"#,
        )
        .unwrap();
        let TransportSecurity::Mtls(mtls) = settings.transport_security else {
            panic!("expected mTLS");
        };
        assert_eq!(mtls.tls.refresh_interval, 30);
        assert_eq!(
            mtls.certificate_verification_mode,
            CertificateVerificationMode::NoHostnameVerification
        );
        assert_eq!(mtls.trust_roots.unwrap().len(), 1);
    }

    #[cfg(feature = "rustls")]
    #[tokio::test]
    async fn test_verifier_outside_mtls_is_a_config_error() {
        use crate::conn::rustls::{ArcPeerVerifier, Verdict};

        let settings: ServerSettings = serde_json::from_str(
            r#"{"bindTarget": {"host": "127.0.0.1", "port": 0}}"#,
        )
        .unwrap();
        let verifier: ArcPeerVerifier =
            std::sync::Arc::new(|_| Verdict::Failed("unused".into()));
        let err = settings
            .into_acceptor_with_verifier(verifier)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::CustomVerifierWithoutMtls)
        ));
    }

    #[cfg(feature = "rustls")]
    #[tokio::test]
    async fn test_reloading_without_paths_is_rejected() {
        let settings: ServerSettings = serde_json::from_str(
            r#"{
                "bindTarget": {"host": "127.0.0.1", "port": 0},
                "transportSecurity": {
                    "security": "reloadingTLS",
                    "certificateChainPEMString": "inline",
                    "privateKeyPEMString": "inline"
                }
            }"#,
        )
        .unwrap();
        let err = settings.into_acceptor().await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::ReloadRequiresPaths)
        ));
    }
}
