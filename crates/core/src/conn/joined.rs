//! Combine two listeners into one acceptor.

use std::io::Result as IoResult;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::conn::{Accepted, Acceptor, Holding, HttpBuilder, HttpConnection, Listener};
use crate::service::ExchangeHandler;

/// A listener accepting from two inner listeners simultaneously.
#[derive(Debug)]
pub struct JoinedListener<A, B> {
    a: A,
    b: B,
}

impl<A, B> JoinedListener<A, B> {
    /// Combine two listeners.
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A, B> Listener for JoinedListener<A, B>
where
    A: Listener + Send + 'static,
    B: Listener + Send + 'static,
{
    type Acceptor = JoinedAcceptor<A::Acceptor, B::Acceptor>;

    async fn try_bind(self) -> crate::Result<Self::Acceptor> {
        let a = self.a.try_bind().await?;
        let b = self.b.try_bind().await?;
        let holdings = a
            .holdings()
            .iter()
            .chain(b.holdings().iter())
            .cloned()
            .collect();
        Ok(JoinedAcceptor { a, b, holdings })
    }
}

/// Acceptor produced by [`JoinedListener`].
#[derive(Debug)]
pub struct JoinedAcceptor<A, B> {
    a: A,
    b: B,
    holdings: Vec<Holding>,
}

/// Connection from either half of a [`JoinedAcceptor`].
#[derive(Debug)]
pub enum JoinedConn<A, B> {
    /// From the first listener.
    A(A),
    /// From the second listener.
    B(B),
}

impl<A, B> HttpConnection for JoinedConn<A, B>
where
    A: HttpConnection,
    B: HttpConnection,
{
    async fn serve(
        self,
        handler: ExchangeHandler,
        builder: Arc<HttpBuilder>,
        graceful_stop_token: Option<CancellationToken>,
    ) -> IoResult<()> {
        match self {
            Self::A(conn) => conn.serve(handler, builder, graceful_stop_token).await,
            Self::B(conn) => conn.serve(handler, builder, graceful_stop_token).await,
        }
    }
}

impl<A, B> Acceptor for JoinedAcceptor<A, B>
where
    A: Acceptor,
    B: Acceptor,
{
    type Conn = JoinedConn<A::Conn, B::Conn>;

    fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    async fn accept(&mut self) -> IoResult<Accepted<Self::Conn>> {
        tokio::select! {
            accepted = self.a.accept() => Ok(accepted?.map_conn(JoinedConn::A)),
            accepted = self.b.accept() => Ok(accepted?.map_conn(JoinedConn::B)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::TcpListener;

    #[tokio::test]
    async fn test_joined_listener_holds_both_addrs() {
        let acceptor = TcpListener::new("127.0.0.1:0")
            .join(TcpListener::new("127.0.0.1:0"))
            .bind()
            .await;
        assert_eq!(acceptor.holdings().len(), 2);
        assert_ne!(
            acceptor.holdings()[0].local_addr,
            acceptor.holdings()[1].local_addr
        );
    }
}
