//! Request body reading.
//!
//! [`RequestBodyReader`] maps the part stream of one request into bounded
//! byte reads. Trailers observed on the terminating `End` part land in a
//! shared [`FinalCell`] so the wrapping [`RequestConcludingReader`] can
//! surface them once the handler's read scope completes.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::HeaderMap;

use crate::proto::{BoxPartReader, ProtoError, RequestPart};
use crate::stream::{AsyncReader, ConcludingReader, FinalCell, ReadError};

/// Single-shot reading session over a request body; yields the trailers when
/// the body has been consumed.
pub type RequestConcludingReader = ConcludingReader<RequestBodyReader, Option<HeaderMap>>;

/// Flag the dispatcher checks after the handler returns to decide whether
/// the inbound half still needs a reset.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReadProgress(Arc<AtomicBool>);

impl ReadProgress {
    pub(crate) fn mark_finished(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum BodyState {
    /// No body part observed yet.
    Initial,
    /// The previous read consumed its chunk entirely.
    NoExcess,
    /// A bounded read left part of a chunk behind.
    Excess(Bytes),
    /// The `End` part was observed; all further reads yield an empty view.
    Finished,
}

/// Single-owner reader over the body bytes of one request.
///
/// Owns the remaining part stream of the request. Delivery is zero-copy: a
/// bounded read splits the pending [`Bytes`] chunk and stashes the excess in
/// place for the next call.
pub struct RequestBodyReader {
    parts: BoxPartReader,
    state: BodyState,
    trailers: FinalCell<Option<HeaderMap>>,
    progress: ReadProgress,
}

impl RequestBodyReader {
    pub(crate) fn new(
        parts: BoxPartReader,
        trailers: FinalCell<Option<HeaderMap>>,
        progress: ReadProgress,
    ) -> Self {
        Self {
            parts,
            state: BodyState::Initial,
            trailers,
            progress,
        }
    }

    /// Pull parts until a non-empty chunk, the end of the body, or an error.
    ///
    /// # Panics
    ///
    /// Panics on protocol-state violations: a second request head inside the
    /// body, or the part stream closing without an `End` part. Both indicate
    /// a defective codec.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            match self.parts.next_part().await? {
                Some(RequestPart::Body(chunk)) => {
                    // Empty data chunks are transparent to callers; an empty
                    // view is reserved for the end of the stream.
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                Some(RequestPart::End(trailers)) => {
                    self.trailers.set(trailers);
                    self.progress.mark_finished();
                    self.state = BodyState::Finished;
                    return Ok(None);
                }
                Some(RequestPart::Head(_)) => {
                    panic!("request head received inside a message body")
                }
                None => panic!("request part stream closed before its end part"),
            }
        }
    }
}

impl Debug for RequestBodyReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            BodyState::Initial => "Initial",
            BodyState::NoExcess => "NoExcess",
            BodyState::Excess(_) => "Excess",
            BodyState::Finished => "Finished",
        };
        f.debug_struct("RequestBodyReader")
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

impl AsyncReader for RequestBodyReader {
    type Element = u8;
    type Error = ProtoError;

    async fn read<R, C, F>(
        &mut self,
        max: Option<usize>,
        body: F,
    ) -> Result<R, ReadError<ProtoError, C>>
    where
        F: FnOnce(&[u8]) -> Result<R, C> + Send,
        R: Send,
        C: Send,
    {
        let chunk = match std::mem::replace(&mut self.state, BodyState::NoExcess) {
            BodyState::Finished => {
                self.state = BodyState::Finished;
                return body(&[]).map_err(ReadError::Callback);
            }
            BodyState::Excess(rest) => rest,
            BodyState::Initial | BodyState::NoExcess => {
                match self.next_chunk().await.map_err(ReadError::Source)? {
                    Some(chunk) => chunk,
                    None => return body(&[]).map_err(ReadError::Callback),
                }
            }
        };

        let mut view = chunk;
        if let Some(limit) = max {
            if view.len() > limit {
                let rest = view.split_off(limit);
                self.state = BodyState::Excess(rest);
            }
        }
        body(&view).map_err(ReadError::Callback)
    }
}
