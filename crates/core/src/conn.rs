//! Connections and listeners.
//!
//! The connection system is layered:
//!
//! 1. [`Listener`] binds to an address and creates an [`Acceptor`]
//! 2. [`Acceptor`] accepts incoming connections as [`Accepted`] structs
//! 3. [`HttpConnection`] serves the accepted connection's exchanges
//!
//! A plain [`TcpListener`] accepts plaintext connections, which are always
//! HTTP/1.1. With the `rustls` feature, [`RustlsListener`] wraps an inner
//! listener in TLS: the handshake's ALPN result decides between HTTP/1.1
//! and HTTP/2 framing, and the peer's certificate chain (mutual TLS) is
//! carried onto every request served on the connection.
//!
//! Two listeners can be combined with [`Listener::join`].

use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::Version;
use http::uri::Scheme;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::service::ExchangeHandler;

mod proto;
pub use proto::HttpBuilder;

pub mod addr;
pub use addr::SocketAddr;

pub mod tcp;
pub use tcp::TcpListener;

mod joined;
pub use joined::{JoinedAcceptor, JoinedConn, JoinedListener};

cfg_feature! {
    #![feature = "rustls"]
    pub mod rustls;
    pub use rustls::RustlsListener;
}

cfg_feature! {
    #![feature = "rustls"]
    /// A type that can convert into a TLS configuration stream.
    ///
    /// A static configuration converts into a one-element stream; any
    /// `Stream` of configurations is a reloading source: each yielded
    /// configuration replaces the previous one for connections accepted
    /// afterwards.
    pub trait IntoConfigStream<C> {
        /// The stream type that yields TLS configurations.
        type Stream: futures_util::Stream<Item = C> + Send + Unpin + 'static;

        /// Consume this value and return the configuration stream.
        fn into_stream(self) -> Self::Stream;
    }
}

/// Represents an accepted connection from an [`Acceptor`].
pub struct Accepted<C> {
    /// The connection, ready to serve exchanges.
    pub conn: C,
    /// The local address this connection was accepted on.
    pub local_addr: SocketAddr,
    /// The remote address of the connecting peer.
    pub remote_addr: SocketAddr,
    /// The HTTP scheme for this connection (http or https).
    pub http_scheme: Scheme,
}

impl<C> Accepted<C> {
    /// Map the connection and return a new `Accepted`.
    #[inline]
    pub fn map_conn<T>(self, wrap_fn: impl FnOnce(C) -> T) -> Accepted<T> {
        let Self {
            conn,
            local_addr,
            remote_addr,
            http_scheme,
        } = self;
        Accepted {
            conn: wrap_fn(conn),
            local_addr,
            remote_addr,
            http_scheme,
        }
    }
}

impl<C> Debug for Accepted<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("http_scheme", &self.http_scheme)
            .finish_non_exhaustive()
    }
}

/// A connection ready to serve HTTP exchanges.
pub trait HttpConnection: Send + 'static {
    /// Serve every exchange arriving on this connection until it closes.
    ///
    /// Implementations that still have protocol selection to do (TLS
    /// handshake, ALPN) finish it here, then hand the stream to the
    /// builder's codec.
    fn serve(
        self,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> impl Future<Output = IoResult<()>> + Send;
}

/// A trait for types that can accept incoming network connections.
pub trait Acceptor: Send {
    /// The connection type produced by this acceptor.
    type Conn: HttpConnection;

    /// Returns the holding information for all addresses this acceptor is
    /// bound to.
    fn holdings(&self) -> &[Holding];

    /// Accepts the next incoming connection.
    fn accept(&mut self) -> impl Future<Output = IoResult<Accepted<Self::Conn>>> + Send;
}

/// Information about a bound listener address.
#[derive(Clone, Debug)]
pub struct Holding {
    /// The local socket address the listener is bound to.
    pub local_addr: SocketAddr,
    /// The HTTP versions supported on this address.
    pub http_versions: Vec<Version>,
    /// The HTTP scheme for connections on this address.
    pub http_scheme: Scheme,
}

impl Display for Holding {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} on {}://{}",
            self.http_versions, self.http_scheme, self.local_addr
        )
    }
}

/// A trait for types that can bind to an address and create an acceptor.
pub trait Listener: Send {
    /// The type of acceptor this listener produces.
    type Acceptor: Acceptor;

    /// Bind to the configured address and return an acceptor.
    ///
    /// # Panics
    ///
    /// Panics if binding fails. Use [`try_bind`](Listener::try_bind) for
    /// fallible binding.
    fn bind(self) -> impl Future<Output = Self::Acceptor> + Send
    where
        Self: Sized + Send + 'static,
    {
        async move { self.try_bind().await.expect("bind failed") }
    }

    /// Attempt to bind to the configured address.
    fn try_bind(self) -> impl Future<Output = crate::Result<Self::Acceptor>> + Send;

    /// Join this listener with another, creating a combined listener that
    /// accepts from both.
    #[inline]
    fn join<T>(self, other: T) -> JoinedListener<Self, T>
    where
        Self: Sized + Send,
    {
        JoinedListener::new(self, other)
    }
}

/// A type-erased async stream.
///
/// Codecs receive the negotiated byte stream through this type so one codec
/// object can frame plaintext and TLS connections alike. The cost is one
/// level of dynamic dispatch per I/O call.
pub struct DynStream {
    reader: Box<dyn AsyncRead + Send + Unpin + 'static>,
    writer: Box<dyn AsyncWrite + Send + Unpin + 'static>,
}

impl DynStream {
    /// Erase a concrete stream.
    pub fn new(stream: impl AsyncRead + AsyncWrite + Send + 'static) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl Debug for DynStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynStream").finish()
    }
}

impl AsyncRead for DynStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        let this = &mut *self;
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DynStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let this = &mut *self;
        Pin::new(&mut this.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = &mut *self;
        Pin::new(&mut this.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = &mut *self;
        Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}

trait ErasedConnection: Send {
    fn serve_boxed(
        self: Box<Self>,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> BoxFuture<'static, IoResult<()>>;
}

impl<T: HttpConnection> ErasedConnection for T {
    fn serve_boxed(
        self: Box<Self>,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> BoxFuture<'static, IoResult<()>> {
        (*self).serve(handler, builder, graceful_stop_token).boxed()
    }
}

/// A type-erased [`HttpConnection`].
pub struct BoxHttpConnection {
    inner: Box<dyn ErasedConnection>,
}

impl BoxHttpConnection {
    /// Erase a concrete connection.
    pub fn new(conn: impl HttpConnection) -> Self {
        Self {
            inner: Box::new(conn),
        }
    }
}

impl Debug for BoxHttpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxHttpConnection").finish()
    }
}

impl HttpConnection for BoxHttpConnection {
    async fn serve(
        self,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> IoResult<()> {
        self.inner
            .serve_boxed(handler, builder, graceful_stop_token)
            .await
    }
}

trait ErasedAcceptor: Send {
    fn holdings(&self) -> &[Holding];
    fn accept_boxed(&mut self) -> BoxFuture<'_, IoResult<Accepted<BoxHttpConnection>>>;
}

impl<A> ErasedAcceptor for A
where
    A: Acceptor,
{
    fn holdings(&self) -> &[Holding] {
        Acceptor::holdings(self)
    }

    fn accept_boxed(&mut self) -> BoxFuture<'_, IoResult<Accepted<BoxHttpConnection>>> {
        async move {
            self.accept()
                .await
                .map(|accepted| accepted.map_conn(BoxHttpConnection::new))
        }
        .boxed()
    }
}

/// A type-erased [`Acceptor`], the form configuration-driven construction
/// produces.
pub struct BoxAcceptor {
    inner: Box<dyn ErasedAcceptor>,
}

impl BoxAcceptor {
    /// Erase a concrete acceptor.
    pub fn new(acceptor: impl Acceptor + 'static) -> Self {
        Self {
            inner: Box::new(acceptor),
        }
    }
}

impl Debug for BoxAcceptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxAcceptor")
            .field("holdings", &self.inner.holdings())
            .finish()
    }
}

impl Acceptor for BoxAcceptor {
    type Conn = BoxHttpConnection;

    fn holdings(&self) -> &[Holding] {
        self.inner.holdings()
    }

    async fn accept(&mut self) -> IoResult<Accepted<Self::Conn>> {
        self.inner.accept_boxed().await
    }
}
