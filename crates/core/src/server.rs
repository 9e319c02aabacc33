//! Server module.

use std::fmt::{self, Debug, Formatter};
use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::conn::{Accepted, Acceptor, Holding, HttpBuilder, HttpConnection, SocketAddr};
use crate::service::Service;

/// HTTP server.
///
/// Couples a bound [`Acceptor`] with an [`HttpBuilder`] and serves a
/// [`Service`]: one task per connection, connections spawning one task per
/// exchange, all of them children of the serve call. Dropping the serve
/// future aborts every in-flight request; a graceful shutdown stops the
/// intake and lets them drain.
pub struct Server<A> {
    acceptor: A,
    builder: Arc<HttpBuilder>,
    handle: ServerHandle,
}

impl<A: Acceptor + Send + 'static> Server<A> {
    /// Create a server from a bound acceptor and protocol builder.
    pub fn new(acceptor: A, builder: HttpBuilder) -> Self {
        let handle = ServerHandle::new(acceptor.holdings().to_vec());
        Self {
            acceptor,
            builder: Arc::new(builder),
            handle,
        }
    }

    /// A handle for querying the bound address and stopping the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// The addresses this server is bound to.
    #[must_use]
    pub fn holdings(&self) -> &[Holding] {
        self.acceptor.holdings()
    }

    /// Serve a [`Service`].
    ///
    /// # Panics
    ///
    /// Panics on a listener-level error. Use [`try_serve`](Self::try_serve)
    /// to handle it.
    pub async fn serve<S>(self, service: S)
    where
        S: Into<Service>,
    {
        self.try_serve(service).await.expect("serve failed");
    }

    /// Try to serve a [`Service`].
    pub async fn try_serve<S>(self, service: S) -> crate::Result<()>
    where
        S: Into<Service>,
    {
        self.inner_serve(service.into(), pending()).await
    }

    /// Serve with a graceful shutdown signal: when `signal` completes the
    /// server stops accepting and lets in-flight exchanges drain.
    pub async fn serve_with_graceful_shutdown<S, G>(self, service: S, signal: G)
    where
        S: Into<Service>,
        G: Future<Output = ()> + Send,
    {
        self.try_serve_with_graceful_shutdown(service, signal)
            .await
            .expect("serve failed");
    }

    /// Like [`serve_with_graceful_shutdown`](Self::serve_with_graceful_shutdown),
    /// surfacing listener errors.
    pub async fn try_serve_with_graceful_shutdown<S, G>(
        self,
        service: S,
        signal: G,
    ) -> crate::Result<()>
    where
        S: Into<Service>,
        G: Future<Output = ()> + Send,
    {
        self.inner_serve(service.into(), signal).await
    }

    async fn inner_serve<G>(mut self, service: Service, signal: G) -> crate::Result<()>
    where
        G: Future<Output = ()> + Send,
    {
        for holding in self.acceptor.holdings() {
            tracing::info!("listening {}", holding);
        }

        let graceful = self.handle.inner.graceful.clone();
        let force = self.handle.inner.force.clone();
        let mut connections = JoinSet::new();
        let mut signal = std::pin::pin!(signal);

        let result = loop {
            tokio::select! {
                () = &mut signal => break Ok(()),
                () = graceful.cancelled() => break Ok(()),
                () = force.cancelled() => break Ok(()),
                accepted = self.acceptor.accept() => match accepted {
                    Ok(Accepted { conn, local_addr, remote_addr, http_scheme }) => {
                        let handler =
                            service.exchange_handler(local_addr, remote_addr, http_scheme);
                        let builder = Arc::clone(&self.builder);
                        let stop = graceful.child_token();
                        connections.spawn(async move {
                            if let Err(err) = conn.serve(handler, builder, Some(stop)).await {
                                tracing::debug!(error = %err, "connection closed with error");
                            }
                        });
                    }
                    Err(err) => break Err(crate::Error::Io(err)),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        // Tell connections to stop taking new exchanges, then either drain
        // the in-flight ones or abort everything outright.
        graceful.cancel();
        if result.is_err() || force.is_cancelled() {
            connections.shutdown().await;
        } else {
            while connections.join_next().await.is_some() {}
        }
        self.handle.inner.closed.store(true, Ordering::Release);
        if let Err(err) = &result {
            tracing::error!(error = %err, "server error");
        }
        result
    }
}

impl<A: Acceptor> Debug for Server<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("holdings", &self.acceptor.holdings())
            .finish_non_exhaustive()
    }
}

struct HandleInner {
    holdings: Vec<Holding>,
    closed: AtomicBool,
    graceful: CancellationToken,
    force: CancellationToken,
}

/// Cloneable handle onto a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    fn new(holdings: Vec<Holding>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                holdings,
                closed: AtomicBool::new(false),
                graceful: CancellationToken::new(),
                force: CancellationToken::new(),
            }),
        }
    }

    /// The first bound address.
    ///
    /// Available from construction until the serve call returns; afterwards
    /// it yields [`Error::ServerClosed`](crate::Error::ServerClosed).
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        let holding = self
            .inner
            .holdings
            .first()
            .ok_or(crate::Error::ServerClosed)?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(crate::Error::ServerClosed);
        }
        Ok(holding.local_addr.clone())
    }

    /// Stop accepting and let in-flight exchanges drain.
    pub fn stop_graceful(&self) {
        self.inner.graceful.cancel();
    }

    /// Abort everything immediately.
    pub fn stop_forcible(&self) {
        self.inner.force.cancel();
    }
}

impl Debug for ServerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
