//! Per-exchange dispatch.
//!
//! [`Service`] owns the boxed middleware chain; a cloneable
//! [`ExchangeHandler`] is derived from it for every accepted connection and
//! drives one [`Exchange`] at a time: validate the first part, construct the
//! per-request handles, run the chain, then reconcile whatever state the
//! handler left behind.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::Version;
use http::uri::Scheme;

use crate::chain::{Never, Next, RequestScope, Stage, Terminal};
use crate::conn::SocketAddr;
use crate::handler::Handler;
use crate::http::body::ReadProgress;
use crate::http::response::Outbound;
use crate::http::{RequestBodyReader, RequestContext, ResponseSender};
use crate::proto::{AbortReason, Exchange, ProtoError, RequestPart};
use crate::stream::{ConcludingReader, FinalCell};

trait ErasedChain: Send + Sync {
    fn run<'a>(&'a self, scope: RequestScope) -> BoxFuture<'a, crate::Result<()>>;
}

impl<S> ErasedChain for S
where
    S: Stage<Input = RequestScope, Fwd = Never>,
{
    fn run<'a>(&'a self, scope: RequestScope) -> BoxFuture<'a, crate::Result<()>> {
        self.intercept(scope, Next::new(|never: Never| match never {}))
    }
}

/// Serves exchanges through a middleware chain ending in a handler.
#[derive(Clone)]
pub struct Service {
    chain: Arc<dyn ErasedChain>,
}

impl Service {
    /// Create a service from a bare handler (an empty chain).
    pub fn new<H: Handler>(handler: H) -> Self {
        Self::chained(Terminal::new(handler))
    }

    /// Create a service from a fully composed chain.
    pub fn chained<S>(stage: S) -> Self
    where
        S: Stage<Input = RequestScope, Fwd = Never>,
    {
        Self {
            chain: Arc::new(stage),
        }
    }

    #[doc(hidden)]
    pub fn exchange_handler(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        http_scheme: Scheme,
    ) -> ExchangeHandler {
        ExchangeHandler {
            chain: Arc::clone(&self.chain),
            local_addr,
            remote_addr,
            http_scheme,
            http_version: Version::HTTP_11,
            #[cfg(feature = "rustls")]
            peer_certificates: None,
        }
    }
}

impl Debug for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl<H: Handler> From<H> for Service {
    fn from(handler: H) -> Self {
        Self::new(handler)
    }
}

/// Per-connection dispatch handle.
///
/// Carries the connection facts every request on the connection shares;
/// cloned into each per-exchange task.
#[derive(Clone)]
pub struct ExchangeHandler {
    chain: Arc<dyn ErasedChain>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    http_scheme: Scheme,
    http_version: Version,
    #[cfg(feature = "rustls")]
    peer_certificates:
        Option<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>>,
}

impl Debug for ExchangeHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeHandler")
            .field("remote_addr", &self.remote_addr)
            .field("http_version", &self.http_version)
            .finish_non_exhaustive()
    }
}

impl ExchangeHandler {
    /// Record the negotiated protocol version.
    #[must_use]
    pub fn with_http_version(mut self, version: Version) -> Self {
        self.http_version = version;
        self
    }

    cfg_feature! {
        #![feature = "rustls"]
        /// Record the peer certificate chain surfaced by the TLS handshake.
        #[must_use]
        pub fn with_peer_certificates(
            mut self,
            chain: Option<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>>,
        ) -> Self {
            self.peer_certificates = chain;
            self
        }
    }

    fn context(&self) -> RequestContext {
        RequestContext {
            local_addr: self.local_addr.clone(),
            remote_addr: self.remote_addr.clone(),
            http_scheme: self.http_scheme.clone(),
            http_version: self.http_version,
            #[cfg(feature = "rustls")]
            peer_certificates: self.peer_certificates.clone(),
        }
    }

    /// Drive one exchange through the chain.
    ///
    /// The first part must be the request head; anything else tears the
    /// stream down. After the chain returns, the outbound is finished or
    /// aborted according to how far the handler got.
    pub async fn handle(&self, exchange: Exchange) -> crate::Result<()> {
        let Exchange { mut reader, writer } = exchange;

        let head = match reader.next_part().await? {
            Some(RequestPart::Head(head)) => head,
            // The peer closed the stream without starting a request.
            None => return Ok(()),
            Some(part) => {
                tracing::debug!(
                    part = part_name(&part),
                    "request stream did not start with a head"
                );
                let mut writer = writer;
                writer.abort(AbortReason::InternalError).await;
                return Err(ProtoError::Malformed(
                    "request stream did not start with a head".into(),
                )
                .into());
            }
        };

        let trailers = FinalCell::new();
        let progress = ReadProgress::default();
        let body_reader = ConcludingReader::new(
            RequestBodyReader::new(reader, trailers.clone(), progress.clone()),
            trailers,
        );
        let outbound = Outbound::new(writer);
        let response_sender = ResponseSender::new(outbound.clone());
        let scope = RequestScope {
            request: head,
            context: self.context(),
            body_reader,
            response_sender,
        };

        match self.chain.run(scope).await {
            Ok(()) if outbound.finished_writing() => {
                outbound.finish().await?;
                Ok(())
            }
            Ok(()) => {
                // The handler considered itself done but never concluded a
                // response; nothing can be sent on its behalf.
                tracing::error!("handler returned without concluding its response");
                outbound.abort().await;
                Err(crate::Error::other(
                    "handler returned without concluding its response",
                ))
            }
            Err(err) => {
                if progress.is_finished() && outbound.finished_writing() {
                    // The exchange itself completed; close out cleanly.
                    let _ = outbound.finish().await;
                } else {
                    outbound.abort().await;
                }
                tracing::error!(error = %err, "handler failed");
                Err(err)
            }
        }
    }
}

fn part_name(part: &RequestPart) -> &'static str {
    match part {
        RequestPart::Head(_) => "head",
        RequestPart::Body(_) => "body",
        RequestPart::End(_) => "end",
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::FutureExt;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::*;
    use crate::handler::handler_fn;
    use crate::http::{RequestHead, ResponseHead};
    use crate::proto::ResponsePart;
    use crate::stream::{AsyncReader, AsyncWriter};
    use crate::test::TestExchange;

    fn echo_service() -> Service {
        Service::new(handler_fn(|request: RequestHead, _ctx, body_reader: crate::http::RequestConcludingReader, sender: ResponseSender| async move {
            assert_eq!(request.method, Method::POST);
            let (chunks, trailers) = body_reader
                .consume_and_conclude(|body| {
                    async move {
                        let mut chunks = Vec::new();
                        loop {
                            let chunk = body
                                .read(None, |view| Ok::<_, crate::Error>(Bytes::copy_from_slice(view)))
                                .await
                                .map_err(crate::stream::ReadError::unify::<crate::Error>)?;
                            if chunk.is_empty() {
                                break;
                            }
                            chunks.push(chunk);
                        }
                        Ok::<_, crate::Error>(chunks)
                    }
                    .boxed()
                })
                .await?;
            let writer = sender.send(ResponseHead::default()).await?;
            writer
                .produce_and_conclude(|body| {
                    async move {
                        for chunk in chunks {
                            body.write(chunk).await?;
                        }
                        Ok::<_, crate::Error>(((), trailers))
                    }
                    .boxed()
                })
                .await?;
            Ok(())
        }))
    }

    fn handler(service: &Service) -> ExchangeHandler {
        service.exchange_handler(SocketAddr::Unknown, SocketAddr::Unknown, Scheme::HTTP)
    }

    #[tokio::test]
    async fn test_echo_round_trip_with_trailers() {
        let service = echo_service();
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::POST, "/")))
            .await;
        remote
            .send_part(RequestPart::Body(Bytes::from(vec![5u8; 100])))
            .await;
        let mut trailers = HeaderMap::new();
        trailers.insert("trailer", HeaderValue::from_static("test_trailer"));
        remote
            .send_part(RequestPart::End(Some(trailers.clone())))
            .await;

        match remote.recv_part().await.unwrap() {
            ResponsePart::Head(head) => assert_eq!(head.status, StatusCode::OK),
            part => panic!("expected head, got {part:?}"),
        }
        match remote.recv_part().await.unwrap() {
            ResponsePart::Body(chunk) => assert_eq!(chunk, Bytes::from(vec![5u8; 100])),
            part => panic!("expected body, got {part:?}"),
        }
        match remote.recv_part().await.unwrap() {
            ResponsePart::End(t) => assert_eq!(t, Some(trailers)),
            part => panic!("expected end, got {part:?}"),
        }

        task.await.unwrap().unwrap();
        assert!(remote.finished());
        assert_eq!(remote.abort_reason(), None);
    }

    #[tokio::test]
    async fn test_streamed_request_chunks_arrive_in_order() {
        let service = Service::new(handler_fn(|_req, _ctx, body_reader: crate::http::RequestConcludingReader, sender: ResponseSender| async move {
            let (observed, _trailers) = body_reader
                .consume_and_conclude(|body| {
                    async move {
                        let mut observed = Vec::new();
                        for _ in 0..100 {
                            body.read(None, |view| {
                                observed.extend_from_slice(view);
                                Ok::<_, crate::Error>(())
                            })
                            .await
                            .map_err(crate::stream::ReadError::unify::<crate::Error>)?;
                        }
                        Ok::<_, crate::Error>(observed)
                    }
                    .boxed()
                })
                .await?;
            assert_eq!(observed, (0..100u8).collect::<Vec<_>>());
            let writer = sender.send(ResponseHead::default()).await?;
            writer
                .produce_and_conclude(|_body| async move { Ok::<_, crate::Error>(((), None)) }.boxed())
                .await?;
            Ok(())
        }));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::POST, "/")))
            .await;
        for i in 0..100u8 {
            remote.send_part(RequestPart::Body(Bytes::from(vec![i]))).await;
        }
        remote.send_part(RequestPart::End(None)).await;

        while remote.recv_part().await.is_some() {}
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_informational_responses_precede_final_head() {
        let service = Service::new(handler_fn(|_req, _ctx, _body, mut sender: ResponseSender| async move {
            sender.send_informational(StatusCode::CONTINUE.into()).await?;
            sender
                .send_informational(StatusCode::EARLY_HINTS.into())
                .await?;
            let writer = sender.send(ResponseHead::default()).await?;
            let mut trailers = HeaderMap::new();
            trailers.insert("cookie", HeaderValue::from_static("cookie"));
            writer
                .write_and_conclude(Bytes::from_static(&[1, 2]), Some(trailers))
                .await?;
            Ok(())
        }));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::GET, "/")))
            .await;
        remote.send_part(RequestPart::End(None)).await;

        let mut statuses = Vec::new();
        let mut saw_body = false;
        let mut end_trailers = None;
        while let Some(part) = remote.recv_part().await {
            match part {
                ResponsePart::Head(head) => statuses.push(head.status.as_u16()),
                ResponsePart::Body(chunk) => {
                    assert_eq!(chunk, Bytes::from_static(&[1, 2]));
                    saw_body = true;
                }
                ResponsePart::End(trailers) => end_trailers = trailers,
            }
        }
        assert_eq!(statuses, vec![100, 103, 200]);
        assert!(saw_body);
        assert_eq!(
            end_trailers.unwrap().get("cookie"),
            Some(&HeaderValue::from_static("cookie"))
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_before_send_aborts_with_internal_error() {
        let service = Service::new(handler_fn(|_req, _ctx, _body, _sender| async move {
            Err(crate::Error::other(std::io::Error::other("boom")))
        }));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::GET, "/")))
            .await;
        remote.send_part(RequestPart::End(None)).await;

        assert!(task.await.unwrap().is_err());
        assert_eq!(remote.abort_reason(), Some(AbortReason::InternalError));
        assert!(!remote.finished());
    }

    #[tokio::test]
    async fn test_handler_error_after_head_aborts_with_no_error() {
        let service = Service::new(handler_fn(|_req, _ctx, _body, sender: ResponseSender| async move {
            let writer = sender.send(ResponseHead::default()).await?;
            writer
                .produce_and_conclude(|_body| {
                    async move {
                        Err::<((), Option<HeaderMap>), _>(crate::Error::other(
                            std::io::Error::other("mid-stream failure"),
                        ))
                    }
                    .boxed()
                })
                .await?;
            Ok(())
        }));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::GET, "/")))
            .await;
        remote.send_part(RequestPart::End(None)).await;

        assert!(task.await.unwrap().is_err());
        assert_eq!(remote.abort_reason(), Some(AbortReason::NoError));
    }

    #[tokio::test]
    async fn test_handler_returning_without_response_aborts() {
        let service = Service::new(handler_fn(|_req, _ctx, _body, _sender| async move { Ok(()) }));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::GET, "/")))
            .await;
        remote.send_part(RequestPart::End(None)).await;

        assert!(task.await.unwrap().is_err());
        assert_eq!(remote.abort_reason(), Some(AbortReason::InternalError));
    }

    #[tokio::test]
    async fn test_chain_stage_runs_before_handler() {
        use crate::chain::ChainBuilder;

        struct Mark;

        impl Stage for Mark {
            type Input = RequestScope;
            type Fwd = RequestScope;

            fn intercept<'a>(
                &'a self,
                mut scope: RequestScope,
                next: Next<'a, RequestScope>,
            ) -> BoxFuture<'a, crate::Result<()>> {
                scope
                    .request
                    .headers
                    .insert("x-stage", HeaderValue::from_static("seen"));
                next.run(scope)
            }
        }

        let service = ChainBuilder::root().then(Mark).terminate(handler_fn(
            |request: RequestHead, _ctx, _body, sender: ResponseSender| async move {
                assert_eq!(
                    request.headers.get("x-stage"),
                    Some(&HeaderValue::from_static("seen"))
                );
                let writer = sender.send(ResponseHead::default()).await?;
                writer
                    .produce_and_conclude(|_body| {
                        async move { Ok::<_, crate::Error>(((), None)) }.boxed()
                    })
                    .await?;
                Ok(())
            },
        ));
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Head(RequestHead::new(Method::GET, "/")))
            .await;
        remote.send_part(RequestPart::End(None)).await;
        while remote.recv_part().await.is_some() {}

        task.await.unwrap().unwrap();
        assert!(remote.finished());
    }

    #[tokio::test]
    async fn test_first_part_not_head_tears_down() {
        let service = echo_service();
        let (mut remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        let task = tokio::spawn(async move { dispatch.handle(exchange).await });

        remote
            .send_part(RequestPart::Body(Bytes::from_static(b"junk")))
            .await;

        assert!(task.await.unwrap().is_err());
        assert_eq!(remote.abort_reason(), Some(AbortReason::InternalError));
    }

    #[tokio::test]
    async fn test_stream_closed_before_head_is_quiet() {
        let service = echo_service();
        let (remote, exchange) = TestExchange::new();
        let dispatch = handler(&service);
        drop(remote.into_sender());
        dispatch.handle(exchange).await.unwrap();
    }
}
