//! Protocol-independent streaming primitives.
//!
//! [`AsyncReader`] and [`AsyncWriter`] are the minimal chunked-streaming
//! traits the HTTP layer is built on; nothing in this module knows about
//! HTTP. A reader hands callbacks borrowed views into the transport's
//! buffers and stashes any excess in place, so a bounded read never copies.
//! [`TerminalWriter`] extends a writer with a typed terminal element, and
//! the [`ConcludingReader`]/[`ConcludingWriter`] wrappers bind that terminal
//! element to the exit of a caller-supplied scope: the terminal element is
//! surfaced (or written) after the callback's last chunk but before any
//! scope wrapped around the call (a tracing span, a timeout) unwinds.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::future::Future;

mod concluding;
pub use concluding::{ConcludingReader, ConcludingWriter, FinalCell};

/// Failure of a [`read`](AsyncReader::read), keeping the underlying source's
/// errors apart from errors returned by the caller's own callback.
#[derive(Debug)]
pub enum ReadError<S, C> {
    /// The underlying source failed.
    Source(S),
    /// The read callback returned an error of its own.
    Callback(C),
}

impl<S, C> ReadError<S, C> {
    /// Collapse both variants into one error type.
    #[inline]
    pub fn unify<E>(self) -> E
    where
        E: From<S> + From<C>,
    {
        match self {
            Self::Source(e) => e.into(),
            Self::Callback(e) => e.into(),
        }
    }
}

impl<S> ReadError<S, Infallible> {
    /// Extract the source error when the callback could not fail.
    #[inline]
    pub fn into_source(self) -> S {
        match self {
            Self::Source(e) => e,
            Self::Callback(i) => match i {},
        }
    }
}

impl<S: Display, C: Display> Display for ReadError<S, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(e) => Display::fmt(e, f),
            Self::Callback(e) => Display::fmt(e, f),
        }
    }
}

impl<S, C> StdError for ReadError<S, C>
where
    S: Display + fmt::Debug,
    C: Display + fmt::Debug,
{
}

/// Cooperative chunked reader.
///
/// The reader owns at most a single stashed chunk: when a producer offers
/// more elements than a bounded read asked for, the excess waits in place
/// for the next call.
pub trait AsyncReader: Send {
    /// Element of the stream (`u8` for byte streams).
    type Element: Send + Sync;
    /// Error reported by the underlying source.
    type Error: Send;

    /// Read one chunk of at most `max` elements and hand it to `body` as a
    /// borrowed view. An empty view signals end of stream. With `max` of
    /// `None` the next chunk is delivered whole.
    ///
    /// Errors from the source and errors returned by `body` stay
    /// distinguishable through [`ReadError`].
    fn read<R, C, F>(
        &mut self,
        max: Option<usize>,
        body: F,
    ) -> impl Future<Output = Result<R, ReadError<Self::Error, C>>> + Send
    where
        F: FnOnce(&[Self::Element]) -> Result<R, C> + Send,
        R: Send,
        C: Send;

    /// Accumulate chunks until end of stream and hand the collected elements
    /// to `body`. At most `up_to` elements are kept; anything past the limit
    /// is read and discarded.
    fn collect<R, C, F>(
        &mut self,
        up_to: usize,
        body: F,
    ) -> impl Future<Output = Result<R, ReadError<Self::Error, C>>> + Send
    where
        F: FnOnce(&[Self::Element]) -> Result<R, C> + Send,
        R: Send,
        C: Send,
        Self::Element: Clone,
        Self: Sized,
    {
        async move {
            let mut collected: Vec<Self::Element> = Vec::new();
            loop {
                let at_end = self
                    .read(None, |view| {
                        if collected.len() < up_to {
                            let take = (up_to - collected.len()).min(view.len());
                            collected.extend_from_slice(&view[..take]);
                        }
                        Ok::<_, Infallible>(view.is_empty())
                    })
                    .await
                    .map_err(|e| ReadError::Source(e.into_source()))?;
                if at_end {
                    break;
                }
            }
            body(&collected).map_err(ReadError::Callback)
        }
    }
}

/// Cooperative chunked writer.
pub trait AsyncWriter: Send {
    /// Element of the stream.
    type Element: Send;
    /// Error reported by the underlying sink.
    type Error: Send;

    /// Append one chunk to the sink.
    fn write(
        &mut self,
        element: Self::Element,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A writer whose stream ends with exactly one typed terminal element.
pub trait TerminalWriter: AsyncWriter {
    /// The terminal element (trailers, for HTTP responses).
    type Final: Send;

    /// Write the terminal element. No further writes are legal afterwards.
    fn terminate(
        &mut self,
        final_element: Self::Final,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
