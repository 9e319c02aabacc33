//! TCP listener: plaintext connections, HTTP/1.1 only.

use std::io::Result as IoResult;
use std::sync::Arc;

use http::Version;
use http::uri::Scheme;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::conn::{Accepted, Acceptor, DynStream, Holding, HttpBuilder, HttpConnection, Listener};
use crate::service::ExchangeHandler;

/// A TCP listener.
#[derive(Debug)]
pub struct TcpListener<T> {
    local_addr: T,
}

impl<T: ToSocketAddrs + Send + 'static> TcpListener<T> {
    /// Create a listener for the given address; nothing is bound until
    /// [`bind`](Listener::bind) is called.
    pub fn new(local_addr: T) -> Self {
        Self { local_addr }
    }

    cfg_feature! {
        #![feature = "rustls"]
        /// Wrap this listener in TLS with the given rustls configuration
        /// (or stream of configurations, for hot reload).
        pub fn rustls<C>(self, config: C) -> crate::conn::rustls::RustlsListener<C::Stream, Self>
        where
            C: crate::conn::IntoConfigStream<crate::conn::rustls::RustlsConfig>,
        {
            crate::conn::rustls::RustlsListener::new(config.into_stream(), self)
        }
    }
}

impl<T: ToSocketAddrs + Send + 'static> Listener for TcpListener<T> {
    type Acceptor = TcpAcceptor;

    async fn try_bind(self) -> crate::Result<Self::Acceptor> {
        let inner = TokioTcpListener::bind(self.local_addr).await?;
        let holding = Holding {
            local_addr: inner.local_addr()?.into(),
            http_versions: vec![Version::HTTP_11],
            http_scheme: Scheme::HTTP,
        };
        Ok(TcpAcceptor {
            inner,
            holdings: vec![holding],
        })
    }
}

/// Acceptor produced by [`TcpListener`].
#[derive(Debug)]
pub struct TcpAcceptor {
    inner: TokioTcpListener,
    holdings: Vec<Holding>,
}

impl Acceptor for TcpAcceptor {
    type Conn = TcpStream;

    #[inline]
    fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    #[inline]
    async fn accept(&mut self) -> IoResult<Accepted<Self::Conn>> {
        let (conn, remote_addr) = self.inner.accept().await?;
        Ok(Accepted {
            conn,
            local_addr: self.holdings[0].local_addr.clone(),
            remote_addr: remote_addr.into(),
            http_scheme: Scheme::HTTP,
        })
    }
}

impl HttpConnection for TcpStream {
    async fn serve(
        self,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> IoResult<()> {
        builder
            .serve_connection(
                DynStream::new(self),
                Version::HTTP_11,
                handler,
                graceful_stop_token,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::conn::Listener;

    #[tokio::test]
    async fn test_tcp_listener_accepts() {
        let mut acceptor = TcpListener::new("127.0.0.1:0").bind().await;
        let addr = acceptor.holdings()[0]
            .local_addr
            .clone()
            .into_std()
            .unwrap();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let accepted = acceptor.accept().await.unwrap();
        assert_eq!(accepted.http_scheme, Scheme::HTTP);
        assert!(accepted.remote_addr.is_ipv4());
    }

    #[test]
    fn test_holding_display() {
        let holding = Holding {
            local_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 80)).into(),
            http_versions: vec![Version::HTTP_11],
            http_scheme: Scheme::HTTP,
        };
        assert_eq!(holding.to_string(), "[HTTP/1.1] on http://127.0.0.1:80");
    }
}
