use std::convert::Infallible;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use super::{AsyncReader, TerminalWriter};

/// Shared slot for a stream's terminal element.
///
/// The inner reader fills the cell when it observes the end of the stream;
/// the [`ConcludingReader`] holding the other reference takes the value once
/// its callback has returned. The cell is only ever written and read from
/// the same task, never concurrently.
pub struct FinalCell<F> {
    slot: Arc<Mutex<Option<F>>>,
}

impl<F> FinalCell<F> {
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Store the terminal element.
    ///
    /// # Panics
    ///
    /// Panics if the cell was already filled; a stream has exactly one
    /// terminal element.
    pub fn set(&self, final_element: F) {
        let mut slot = self.slot.lock();
        assert!(slot.is_none(), "stream produced a second terminal element");
        *slot = Some(final_element);
    }

    /// Take the terminal element out of the cell, if present.
    pub fn take(&self) -> Option<F> {
        self.slot.lock().take()
    }

    /// Whether the terminal element has been captured.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<F> Default for FinalCell<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Clone for FinalCell<F> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<F> Debug for FinalCell<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalCell")
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// Single-shot streaming session that ends by surfacing a typed terminal
/// element alongside the caller's result.
///
/// The callback runs with a borrowed view of the underlying reader; when it
/// returns successfully the wrapper drains whatever the callback left
/// unread, then yields the terminal element the inner reader captured at end
/// of stream. On a callback error nothing more is read and no terminal
/// element is produced; the failure unwinds through whatever scope wraps
/// the call.
pub struct ConcludingReader<R, F> {
    inner: R,
    final_cell: FinalCell<F>,
}

impl<R, F> ConcludingReader<R, F>
where
    R: AsyncReader,
    F: Send,
{
    /// Wrap `inner`, whose end-of-stream handling fills `final_cell`.
    pub fn new(inner: R, final_cell: FinalCell<F>) -> Self {
        Self { inner, final_cell }
    }

    /// Run `body` with exclusive access to the underlying reader, then yield
    /// the terminal element captured while reading.
    ///
    /// Consumes the session; the borrow handed to `body` cannot outlive it.
    ///
    /// ```compile_fail
    /// use futures_util::FutureExt;
    /// use wharf_core::http::RequestConcludingReader;
    ///
    /// async fn demo(reader: RequestConcludingReader) {
    ///     let _ = reader
    ///         .consume_and_conclude(|_body| async { Ok::<_, wharf_core::Error>(()) }.boxed());
    ///     // error: `reader` was moved by the first call
    ///     let _ = reader
    ///         .consume_and_conclude(|_body| async { Ok::<_, wharf_core::Error>(()) }.boxed());
    /// }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the stream ends without its terminal element; a conforming
    /// source always produces one.
    pub async fn consume_and_conclude<T, E>(
        mut self,
        body: impl for<'a> FnOnce(&'a mut R) -> BoxFuture<'a, Result<T, E>> + Send,
    ) -> Result<(T, F), E>
    where
        T: Send,
        E: From<R::Error> + Send,
    {
        let out = body(&mut self.inner).await?;
        // Whatever the callback left unread still has to be consumed for the
        // terminal element to be observed.
        loop {
            let at_end = self
                .inner
                .read(None, |view| Ok::<_, Infallible>(view.is_empty()))
                .await
                .map_err(|e| E::from(e.into_source()))?;
            if at_end {
                break;
            }
        }
        let final_element = self
            .final_cell
            .take()
            .expect("stream ended without its terminal element");
        Ok((out, final_element))
    }
}

impl<R, F> Debug for ConcludingReader<R, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcludingReader").finish_non_exhaustive()
    }
}

/// Single-shot streaming session that writes a typed terminal element on
/// scope exit.
///
/// [`produce_and_conclude`](Self::produce_and_conclude) runs the callback
/// with a borrowed view of the underlying writer and writes the terminal
/// element the callback returned: after its last chunk, before the caller's
/// enclosing scope unwinds. If the callback fails, no terminal element is
/// written and the stream is left for the dispatcher to tear down.
pub struct ConcludingWriter<W> {
    inner: W,
}

impl<W> ConcludingWriter<W>
where
    W: TerminalWriter,
{
    /// Wrap a terminal-element-aware writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Run `body` with exclusive access to the underlying writer, then write
    /// the terminal element it returned.
    pub async fn produce_and_conclude<T, E>(
        mut self,
        body: impl for<'a> FnOnce(&'a mut W) -> BoxFuture<'a, Result<(T, W::Final), E>> + Send,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<W::Error> + Send,
    {
        let (out, final_element) = body(&mut self.inner).await?;
        self.inner.terminate(final_element).await.map_err(E::from)?;
        Ok(out)
    }

    /// Write a single chunk, then the terminal element.
    pub async fn write_and_conclude(
        mut self,
        element: W::Element,
        final_element: W::Final,
    ) -> Result<(), W::Error> {
        self.inner.write(element).await?;
        self.inner.terminate(final_element).await
    }
}

impl<W> Debug for ConcludingWriter<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcludingWriter").finish_non_exhaustive()
    }
}
