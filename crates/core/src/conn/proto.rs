//! Per-connection protocol driving.

use std::fmt::{self, Debug, Formatter};
use std::io::{Error as IoError, Result as IoResult};
use std::sync::Arc;

use http::Version;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{BackpressureStrategy, Http2Settings};
use crate::conn::DynStream;
use crate::proto::HttpCodec;
use crate::service::ExchangeHandler;

/// Protocol settings plus the wire codec; drives accepted connections.
///
/// One `HttpBuilder` is shared by every connection of a server. The
/// negotiated protocol version of a connection selects the codec entry
/// point; each exchange the codec yields is then served on its own task.
pub struct HttpBuilder {
    pub(crate) codec: Arc<dyn HttpCodec>,
    pub(crate) backpressure: BackpressureStrategy,
    pub(crate) http2: Http2Settings,
}

impl HttpBuilder {
    /// Create a builder around a codec, with default settings.
    pub fn new(codec: Arc<dyn HttpCodec>) -> Self {
        Self {
            codec,
            backpressure: BackpressureStrategy::default(),
            http2: Http2Settings::default(),
        }
    }

    /// Set the backpressure watermarks handed to the codec.
    #[must_use]
    pub fn backpressure(mut self, strategy: BackpressureStrategy) -> Self {
        self.backpressure = strategy;
        self
    }

    /// Set the HTTP/2 tunables handed to the codec. Values are clamped to
    /// their protocol ranges.
    #[must_use]
    pub fn http2(mut self, settings: Http2Settings) -> Self {
        self.http2 = settings.clamped();
        self
    }

    /// Serve one connection until it closes.
    ///
    /// Every exchange runs as a child task of this call; cancelling the
    /// graceful-stop token stops the intake of new exchanges and lets the
    /// in-flight ones drain, while dropping the returned future aborts them.
    pub async fn serve_connection(
        &self,
        io: DynStream,
        version: Version,
        handler: ExchangeHandler,
        graceful_stop_token: Option<CancellationToken>,
    ) -> IoResult<()> {
        let handler = handler.with_http_version(version);
        let mut exchanges = match version {
            Version::HTTP_2 => self.codec.http2(io, self.http2.clamped(), self.backpressure),
            _ => self.codec.http1(io, self.backpressure),
        };
        let stop = graceful_stop_token.unwrap_or_default();
        let mut tasks = JoinSet::new();

        let result = loop {
            tokio::select! {
                () = stop.cancelled() => break Ok(()),
                next = exchanges.next_exchange() => match next {
                    Ok(Some(exchange)) => {
                        let handler = handler.clone();
                        tasks.spawn(async move {
                            if let Err(err) = handler.handle(exchange).await {
                                tracing::debug!(error = %err, "exchange failed");
                            }
                        });
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        while tasks.join_next().await.is_some() {}
        result.map_err(|e| IoError::other(e.to_string()))
    }
}

impl Debug for HttpBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBuilder")
            .field("backpressure", &self.backpressure)
            .field("http2", &self.http2)
            .finish_non_exhaustive()
    }
}
