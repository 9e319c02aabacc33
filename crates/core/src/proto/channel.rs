//! Bounded in-memory element channel with low/high watermarks.
//!
//! The producer stalls once `high` elements are queued and resumes when the
//! backlog drains to `low`. This is the buffering strategy between a
//! transport and the part layer: the channel itself is the only buffer, and
//! its hysteresis keeps the producer from oscillating at the limit.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::BackpressureStrategy;

/// The receiving half was dropped; the element could not be queued.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct Closed;

struct State<T> {
    queue: VecDeque<T>,
    gated: bool,
    tx_closed: bool,
    rx_closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    low: usize,
    high: usize,
    readable: Notify,
    writable: Notify,
}

/// Create a watermark-bounded channel.
///
/// The strategy must already be validated: `low <= high`.
pub fn watermark<T: Send>(strategy: BackpressureStrategy) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            gated: false,
            tx_closed: false,
            rx_closed: false,
        }),
        low: strategy.low,
        high: strategy.high,
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Producing half of a watermark channel.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> Sender<T> {
    /// Queue one element, waiting while the channel is gated above its high
    /// watermark.
    pub async fn send(&self, item: T) -> Result<(), Closed> {
        loop {
            let notified = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.rx_closed {
                    return Err(Closed);
                }
                if !state.gated {
                    state.queue.push_back(item);
                    if state.queue.len() >= self.shared.high {
                        state.gated = true;
                    }
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Whether the receiving half is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().rx_closed
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.shared.state.lock().tx_closed = true;
        self.shared.readable.notify_waiters();
    }
}

impl<T> Debug for Sender<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("queued", &self.shared.state.lock().queue.len())
            .finish()
    }
}

/// Consuming half of a watermark channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> Receiver<T> {
    /// Take the next queued element; `None` once the sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    if state.gated && state.queue.len() <= self.shared.low {
                        state.gated = false;
                        drop(state);
                        self.shared.writable.notify_waiters();
                    }
                    return Some(item);
                }
                if state.tx_closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.state.lock().rx_closed = true;
        self.shared.writable.notify_waiters();
    }
}

impl<T> Debug for Receiver<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("queued", &self.shared.state.lock().queue.len())
            .finish()
    }
}
