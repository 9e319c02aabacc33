//! Request head and per-request context.

use http::uri::{Authority, Scheme};
use http::{HeaderMap, Method, Version};

use crate::conn::SocketAddr;

/// Head of an incoming request.
///
/// Carries the HTTP/2-shaped pseudo-header fields; an HTTP/1.1 codec fills
/// `scheme` and `authority` from the connection and the `Host` header.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request scheme, when the codec knows it.
    pub scheme: Option<Scheme>,
    /// Request authority (host and optional port).
    pub authority: Option<Authority>,
    /// Path and query exactly as received.
    pub path: String,
    /// Header fields.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Create a head with the given method and path and no headers.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme: None,
            authority: None,
            path: path.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// Immutable per-request metadata.
///
/// Created at request intake and handed to the handler alongside the head;
/// discarded when the handler returns.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RequestContext {
    /// Address the connection was accepted on.
    pub local_addr: SocketAddr,
    /// Address of the connecting peer.
    pub remote_addr: SocketAddr,
    /// Scheme of the connection (http or https).
    pub http_scheme: Scheme,
    /// Negotiated protocol version of the connection.
    pub http_version: Version,
    /// The peer's certificate chain, when the connection is mutual TLS and
    /// the peer presented one.
    #[cfg(feature = "rustls")]
    #[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
    pub peer_certificates: Option<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::Unknown,
            remote_addr: SocketAddr::Unknown,
            http_scheme: Scheme::HTTP,
            http_version: Version::HTTP_11,
            #[cfg(feature = "rustls")]
            peer_certificates: None,
        }
    }
}
