//! Response writing.
//!
//! All outbound parts of one exchange funnel through a single [`Outbound`]
//! handle, which serializes writes and enforces the legal ordering:
//! informational heads, one final head, body chunks, one `End`. The
//! user-facing handles are affine ([`ResponseSender::send`] consumes the
//! sender, [`ResponseConcludingWriter`] methods consume the writer), so a
//! second consumption is a compile error rather than a runtime one. The
//! write-state guard stays in place for the orderings move semantics cannot
//! express; violating it is a bug in the core or a codec and aborts.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::Mutex as AsyncMutex;

use crate::proto::{AbortReason, BoxPartWriter, ProtoError, ResponsePart};
use crate::stream::{AsyncWriter, ConcludingWriter, TerminalWriter};

/// Head of an outgoing response.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResponseHead {
    /// Response status.
    pub status: StatusCode,
    /// Header fields.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Create a head with the given status and no headers.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl From<StatusCode> for ResponseHead {
    fn from(status: StatusCode) -> Self {
        Self::new(status)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum WriteState {
    NotStarted,
    HeadSent,
    Ending,
    Ended,
}

/// Serialized access to the outbound part writer plus its write-state guard.
///
/// Cloned between the sender, the body writer it yields, and the dispatcher;
/// only one of them writes at a time.
#[derive(Clone)]
pub(crate) struct Outbound {
    writer: Arc<AsyncMutex<BoxPartWriter>>,
    state: Arc<parking_lot::Mutex<WriteState>>,
}

impl Outbound {
    pub(crate) fn new(writer: BoxPartWriter) -> Self {
        Self {
            writer: Arc::new(AsyncMutex::new(writer)),
            state: Arc::new(parking_lot::Mutex::new(WriteState::NotStarted)),
        }
    }

    fn state(&self) -> WriteState {
        *self.state.lock()
    }

    pub(crate) fn head_sent(&self) -> bool {
        self.state() >= WriteState::HeadSent
    }

    pub(crate) fn finished_writing(&self) -> bool {
        self.state() == WriteState::Ended
    }

    async fn send_informational(&self, head: ResponseHead) -> Result<(), ProtoError> {
        assert!(
            head.status.is_informational(),
            "informational response sent with non-informational status {}",
            head.status
        );
        assert_eq!(
            self.state(),
            WriteState::NotStarted,
            "informational response after the final response head"
        );
        self.writer
            .lock()
            .await
            .write_part(ResponsePart::Head(head))
            .await
    }

    async fn send_head(&self, head: ResponseHead) -> Result<(), ProtoError> {
        assert!(
            !head.status.is_informational(),
            "final response sent with informational status {}",
            head.status
        );
        {
            let mut state = self.state.lock();
            assert_eq!(
                *state,
                WriteState::NotStarted,
                "final response head already sent"
            );
            *state = WriteState::HeadSent;
        }
        self.writer
            .lock()
            .await
            .write_part(ResponsePart::Head(head))
            .await
    }

    async fn write_body(&self, chunk: Bytes) -> Result<(), ProtoError> {
        assert_eq!(
            self.state(),
            WriteState::HeadSent,
            "response body chunk written outside the head-to-end window"
        );
        self.writer
            .lock()
            .await
            .write_part(ResponsePart::Body(chunk))
            .await
    }

    async fn write_end(&self, trailers: Option<HeaderMap>) -> Result<(), ProtoError> {
        {
            let mut state = self.state.lock();
            assert_eq!(
                *state,
                WriteState::HeadSent,
                "response end written out of order"
            );
            *state = WriteState::Ending;
        }
        self.writer
            .lock()
            .await
            .write_part(ResponsePart::End(trailers))
            .await?;
        *self.state.lock() = WriteState::Ended;
        Ok(())
    }

    pub(crate) async fn finish(&self) -> Result<(), ProtoError> {
        self.writer.lock().await.finish().await
    }

    /// Abnormal teardown; the reason follows from how far the response got.
    pub(crate) async fn abort(&self) {
        let reason = if self.head_sent() {
            AbortReason::NoError
        } else {
            AbortReason::InternalError
        };
        self.writer.lock().await.abort(reason).await;
    }
}

impl Debug for Outbound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Single-owner sink for the body bytes of one response.
///
/// Exists only between the final head and the response's conclusion; it is
/// only ever reachable through [`ResponseConcludingWriter`].
pub struct ResponseBodyWriter {
    outbound: Outbound,
}

impl Debug for ResponseBodyWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBodyWriter").finish_non_exhaustive()
    }
}

impl AsyncWriter for ResponseBodyWriter {
    type Element = Bytes;
    type Error = crate::Error;

    async fn write(&mut self, chunk: Bytes) -> crate::Result<()> {
        self.outbound.write_body(chunk).await.map_err(Into::into)
    }
}

impl TerminalWriter for ResponseBodyWriter {
    type Final = Option<HeaderMap>;

    async fn terminate(&mut self, trailers: Option<HeaderMap>) -> crate::Result<()> {
        self.outbound.write_end(trailers).await.map_err(Into::into)
    }
}

/// Single-shot writing session over a response body; writes the terminating
/// `End` (with optional trailers) when its scope concludes.
pub type ResponseConcludingWriter = ConcludingWriter<ResponseBodyWriter>;

/// Single-shot capability to respond to one request.
///
/// Informational (1xx) responses may be sent any number of times through
/// [`send_informational`](Self::send_informational); sending the final head
/// consumes the sender, so informational responses always precede it.
pub struct ResponseSender {
    outbound: Outbound,
}

impl ResponseSender {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }

    /// Send an informational response.
    ///
    /// # Panics
    ///
    /// Panics before any wire I/O if `head` does not carry a 1xx status;
    /// using a non-informational status here is a bug in the caller.
    pub async fn send_informational(&mut self, head: ResponseHead) -> crate::Result<()> {
        self.outbound
            .send_informational(head)
            .await
            .map_err(Into::into)
    }

    /// Send the final response head, yielding the concluding body writer.
    ///
    /// Consumes the sender:
    ///
    /// ```compile_fail
    /// use wharf_core::http::{ResponseHead, ResponseSender};
    ///
    /// async fn demo(sender: ResponseSender) {
    ///     let _ = sender.send(ResponseHead::default());
    ///     // error: `sender` was moved by the first call
    ///     let _ = sender.send(ResponseHead::default());
    /// }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics before any wire I/O if `head` carries an informational status.
    pub async fn send(self, head: ResponseHead) -> crate::Result<ResponseConcludingWriter> {
        self.outbound.send_head(head).await?;
        Ok(ConcludingWriter::new(ResponseBodyWriter {
            outbound: self.outbound,
        }))
    }
}

impl Debug for ResponseSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSender").finish_non_exhaustive()
    }
}
