//! Handler trait for serving one complete exchange.
//!
//! A handler owns the whole lifetime of a request: head, body chunks,
//! trailers, informational responses, the final head, response body and
//! response trailers all happen inside one `handle` call. Anything wrapped
//! around that call (a tracing span, a timeout, a cancellation scope)
//! therefore observes the complete exchange.
//!
//! The three streaming arguments are single-shot: the body reader and the
//! response sender are moved into the methods that consume them, so using
//! either twice does not compile.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;

use async_trait::async_trait;

use crate::http::{RequestContext, RequestHead, RequestConcludingReader, ResponseSender};

/// Serves one request/response exchange.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one exchange.
    ///
    /// The implementation reads the request body through `body_reader`,
    /// responds through `response_sender`, and returns once the exchange is
    /// complete. Returning an error tears the stream down; the server never
    /// responds on the handler's behalf.
    async fn handle(
        &self,
        request: RequestHead,
        context: RequestContext,
        body_reader: RequestConcludingReader,
        response_sender: ResponseSender,
    ) -> crate::Result<()>;
}

/// Wrap an async function as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestHead, RequestContext, RequestConcludingReader, ResponseSender) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    FnHandler { inner: f }
}

/// A [`Handler`] backed by a plain async function. Created by
/// [`handler_fn`].
pub struct FnHandler<F> {
    inner: F,
}

impl<F> Debug for FnHandler<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestHead, RequestContext, RequestConcludingReader, ResponseSender) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        request: RequestHead,
        context: RequestContext,
        body_reader: RequestConcludingReader,
        response_sender: ResponseSender,
    ) -> crate::Result<()> {
        (self.inner)(request, context, body_reader, response_sender).await
    }
}
