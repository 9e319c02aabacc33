//! Part-level protocol surface.
//!
//! The core never parses HTTP/1.1 or HTTP/2 itself. A wire codec, an
//! external collaborator implementing [`HttpCodec`], frames a negotiated
//! byte stream into [`Exchange`]s, each a stream of [`RequestPart`]s paired
//! with a sink of [`ResponsePart`]s. Everything above this module works in
//! terms of parts: `Head`, zero or more `Body` chunks, and a terminating
//! `End` carrying optional trailers.
//!
//! How parts appear on the wire is the codec's business: on HTTP/1.1,
//! trailers imply chunked transfer encoding, and a streamed response body
//! without a `Content-Length` header defaults to chunked.

use std::fmt::{self, Debug, Formatter};
use std::io::Error as IoError;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use thiserror::Error;

use crate::BoxedError;
use crate::config::{BackpressureStrategy, Http2Settings};
use crate::conn::DynStream;
use crate::http::{RequestHead, ResponseHead};

pub mod channel;

/// One element of an inbound request stream.
///
/// A codec produces exactly one `Head`, any number of `Body` chunks and one
/// terminating `End` per request.
#[derive(Debug)]
pub enum RequestPart {
    /// The request head. Always the first part of a request.
    Head(RequestHead),
    /// One chunk of the request body.
    Body(Bytes),
    /// End of the request, with trailer fields when the peer sent any.
    End(Option<HeaderMap>),
}

/// One element of an outbound response stream.
///
/// The server writes any number of informational (1xx) `Head` parts, exactly
/// one final `Head`, any number of `Body` chunks and exactly one `End`.
#[derive(Debug)]
pub enum ResponsePart {
    /// A response head; informational or final.
    Head(ResponseHead),
    /// One chunk of the response body.
    Body(Bytes),
    /// End of the response, with optional trailer fields.
    End(Option<HeaderMap>),
}

/// Reason a response stream is torn down before its clean end.
///
/// HTTP/2-style codecs map this onto the reset they send: `NoError` becomes
/// `RST_STREAM(NO_ERROR)`, `InternalError` becomes
/// `RST_STREAM(INTERNAL_ERROR)`. HTTP/1.1-style codecs close the connection
/// for either reason, since a half-written pipelined response cannot be
/// drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The final response head had already been written.
    NoError,
    /// The exchange failed before a final response head was written.
    InternalError,
}

/// Source of the request parts of one exchange.
#[async_trait]
pub trait PartReader: Send {
    /// Next part of the request, or `None` once the peer closed the stream.
    ///
    /// A conforming codec closes the stream only after producing
    /// [`RequestPart::End`].
    async fn next_part(&mut self) -> Result<Option<RequestPart>, ProtoError>;
}

/// Sink for the response parts of one exchange.
#[async_trait]
pub trait PartWriter: Send {
    /// Write one response part to the wire.
    async fn write_part(&mut self, part: ResponsePart) -> Result<(), ProtoError>;

    /// Clean end of the response stream, after `End` was written.
    async fn finish(&mut self) -> Result<(), ProtoError>;

    /// Abnormal termination of the response stream.
    async fn abort(&mut self, reason: AbortReason);
}

/// Boxed [`PartReader`].
pub type BoxPartReader = Box<dyn PartReader>;
/// Boxed [`PartWriter`].
pub type BoxPartWriter = Box<dyn PartWriter>;

/// A single request/response exchange produced by a codec.
pub struct Exchange {
    /// The request parts, starting with [`RequestPart::Head`].
    pub reader: BoxPartReader,
    /// The sink the response parts are written to.
    pub writer: BoxPartWriter,
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange").finish_non_exhaustive()
    }
}

/// Stream of exchanges on one connection.
#[async_trait]
pub trait ExchangeSource: Send {
    /// Next exchange, or `None` once the connection closed.
    ///
    /// HTTP/1.1-style codecs yield exchanges strictly in sequence; an
    /// HTTP/2-style codec may yield an exchange while earlier ones are still
    /// being served. The returned future must be cancel-safe: the connection
    /// driver races it against shutdown and retries on the next turn.
    async fn next_exchange(&mut self) -> Result<Option<Exchange>, ProtoError>;
}

/// Boxed [`ExchangeSource`].
pub type BoxExchangeSource = Box<dyn ExchangeSource>;

/// Wire-framing collaborator.
///
/// Implementations own all HTTP/1.1 and HTTP/2 parsing and serialization.
/// The connection layer picks the entry point from the negotiated protocol
/// and hands over the raw byte stream.
pub trait HttpCodec: Send + Sync + 'static {
    /// Frame an HTTP/1.1 connection.
    fn http1(&self, io: DynStream, backpressure: BackpressureStrategy) -> BoxExchangeSource;

    /// Frame an HTTP/2 connection. `settings` arrive already clamped to
    /// their protocol ranges.
    fn http2(
        &self,
        io: DynStream,
        settings: Http2Settings,
        backpressure: BackpressureStrategy,
    ) -> BoxExchangeSource;
}

/// Wire or transport failure reported by a codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// I/O failure on the underlying transport.
    #[error("{0}")]
    Io(#[from] IoError),
    /// The peer sent data the codec could not parse.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The stream was reset by the peer.
    #[error("stream reset by peer")]
    Reset,
    /// The exchange was cancelled before it completed.
    #[error("exchange cancelled")]
    Cancelled,
    /// Any other codec-specific failure.
    #[error("{0}")]
    Other(BoxedError),
}
