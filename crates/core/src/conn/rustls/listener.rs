//! TLS listener and handshake-deferred connection.

use std::fmt::{self, Debug, Formatter};
use std::io::{Error as IoError, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::task::noop_waker_ref;
use futures_util::{Stream, StreamExt};
use http::Version;
use http::uri::Scheme;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;

use super::RustlsConfig;
use crate::conn::{
    Accepted, Acceptor, DynStream, Holding, HttpBuilder, HttpConnection, IntoConfigStream,
    Listener,
};
use crate::service::ExchangeHandler;

/// TLS listener wrapping an inner listener.
///
/// The configuration arrives as a stream: a static configuration is a
/// one-element stream, a reloading source keeps yielding replacements that
/// take effect for subsequently accepted connections.
pub struct RustlsListener<C, T> {
    config_stream: C,
    inner: T,
}

impl<C, T> RustlsListener<C, T>
where
    C: Stream<Item = RustlsConfig> + Send + Unpin + 'static,
    T: Listener,
{
    /// Create a TLS listener from a configuration source and an inner
    /// listener.
    pub fn new(config: impl IntoConfigStream<RustlsConfig, Stream = C>, inner: T) -> Self {
        Self {
            config_stream: config.into_stream(),
            inner,
        }
    }
}

impl<C, T> Debug for RustlsListener<C, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsListener").finish_non_exhaustive()
    }
}

impl<C, T> Listener for RustlsListener<C, T>
where
    C: Stream<Item = RustlsConfig> + Send + Unpin + 'static,
    T: Listener + Send + 'static,
    T::Acceptor: Send + 'static,
    <T::Acceptor as Acceptor>::Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Acceptor = RustlsAcceptor<C, T::Acceptor>;

    async fn try_bind(self) -> crate::Result<Self::Acceptor> {
        let inner = self.inner.try_bind().await?;
        let holdings = inner
            .holdings()
            .iter()
            .map(|holding| Holding {
                local_addr: holding.local_addr.clone(),
                http_versions: vec![Version::HTTP_2, Version::HTTP_11],
                http_scheme: Scheme::HTTPS,
            })
            .collect();
        Ok(RustlsAcceptor {
            config_stream: self.config_stream,
            inner,
            holdings,
            tls_acceptor: None,
        })
    }
}

/// Acceptor produced by [`RustlsListener`].
pub struct RustlsAcceptor<C, T> {
    config_stream: C,
    inner: T,
    holdings: Vec<Holding>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl<C, T> Debug for RustlsAcceptor<C, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsAcceptor")
            .field("holdings", &self.holdings)
            .finish_non_exhaustive()
    }
}

impl<C, T> Acceptor for RustlsAcceptor<C, T>
where
    C: Stream<Item = RustlsConfig> + Send + Unpin + 'static,
    T: Acceptor + Send + 'static,
    T::Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Conn = HandshakeStream<T::Conn>;

    fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    async fn accept(&mut self) -> IoResult<Accepted<Self::Conn>> {
        // Pick up whatever configuration updates are already pending; a
        // reloading source is polled, never awaited, so accepting is not
        // held up behind a refresh interval.
        let mut latest = None;
        while let Poll::Ready(Some(config)) = Pin::new(&mut self.config_stream)
            .poll_next(&mut Context::from_waker(noop_waker_ref()))
        {
            latest = Some(config);
        }
        if let Some(config) = latest {
            match config.build_server_config() {
                Ok(server_config) => {
                    if self.tls_acceptor.is_some() {
                        tracing::info!("tls config changed.");
                    } else {
                        tracing::info!("tls config loaded.");
                    }
                    self.tls_acceptor =
                        Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)));
                }
                Err(err) => tracing::error!(error = %err, "invalid tls config."),
            }
        }
        if self.tls_acceptor.is_none() {
            // The very first configuration may not have been produced yet.
            if let Some(config) = self.config_stream.next().await {
                let server_config = config.build_server_config()?;
                tracing::info!("tls config loaded.");
                self.tls_acceptor =
                    Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)));
            }
        }
        let Some(tls_acceptor) = self.tls_acceptor.clone() else {
            return Err(IoError::other("no valid tls config."));
        };

        let accepted = self.inner.accept().await?;
        let mut accepted =
            accepted.map_conn(|conn| HandshakeStream::new(tls_acceptor.accept(conn)));
        accepted.http_scheme = Scheme::HTTPS;
        Ok(accepted)
    }
}

/// A connection whose TLS handshake has not completed yet.
///
/// The handshake finishes inside [`serve`](HttpConnection::serve), because
/// its ALPN result decides which framing the codec applies and its peer
/// chain belongs on every request context of the connection.
pub struct HandshakeStream<S> {
    accept: tokio_rustls::Accept<S>,
}

impl<S> HandshakeStream<S> {
    pub(crate) fn new(accept: tokio_rustls::Accept<S>) -> Self {
        Self { accept }
    }
}

impl<S> Debug for HandshakeStream<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeStream").finish_non_exhaustive()
    }
}

fn version_from_alpn(proto: Option<&[u8]>) -> Version {
    match proto {
        Some(proto) if proto == b"h2" => Version::HTTP_2,
        _ => Version::HTTP_11,
    }
}

impl<S> HttpConnection for HandshakeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn serve(
        self,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> IoResult<()> {
        let stream: TlsStream<S> = match self.accept.await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(error = %err, "tls handshake failed");
                return Err(err);
            }
        };
        let (_, session) = stream.get_ref();
        let version = version_from_alpn(session.alpn_protocol());
        let peer_certificates = session
            .peer_certificates()
            .map(|certs| certs.to_vec());
        let handler = handler.with_peer_certificates(peer_certificates);
        builder
            .serve_connection(DynStream::new(stream), version, handler, graceful_stop_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_alpn() {
        assert_eq!(version_from_alpn(Some(b"h2")), Version::HTTP_2);
        assert_eq!(version_from_alpn(Some(b"http/1.1")), Version::HTTP_11);
        assert_eq!(version_from_alpn(None), Version::HTTP_11);
    }
}
