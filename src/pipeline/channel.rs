//! Bounded single-producer/single-consumer queue with oldest-drop overflow.
//!
//! Stale audio is worthless: when a stage falls behind, the queue displaces
//! its oldest element to admit the newest instead of blocking the producer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct RingState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

struct Shared<T> {
    capacity: usize,
    state: Mutex<RingState<T>>,
    notify: Notify,
}

/// Sending half. Dropping it closes the queue.
pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

/// Receiving half.
pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a bounded oldest-drop queue with the given capacity.
///
/// # Panics
///
/// Panics if `capacity` is zero; configuration validation rejects that
/// before a pipeline is built.
#[must_use]
pub fn ring_channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    assert!(capacity > 0, "ring channel capacity must be positive");
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(RingState {
            items: VecDeque::with_capacity(capacity),
            closed: false,
            dropped: 0,
        }),
        notify: Notify::new(),
    });
    (
        RingSender {
            shared: Arc::clone(&shared),
        },
        RingReceiver { shared },
    )
}

impl<T> RingSender<T> {
    /// Enqueue an item, displacing the oldest if the queue is full.
    ///
    /// Returns the displaced item so the caller can dispose of it and
    /// account for the drop.
    pub fn send(&self, item: T) -> Option<T> {
        let displaced = {
            let mut state = self.shared.state.lock().expect("ring channel lock");
            if state.closed {
                return Some(item);
            }
            let displaced = if state.items.len() >= self.shared.capacity {
                state.dropped += 1;
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            displaced
        };
        self.shared.notify.notify_one();
        displaced
    }

    /// Total items displaced by overflow so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().expect("ring channel lock").dropped
    }

    /// Close the queue. The receiver drains what remains, then sees `None`.
    pub fn close(&self) {
        self.shared
            .state
            .lock()
            .expect("ring channel lock")
            .closed = true;
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for RingSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> RingReceiver<T> {
    /// Await the next item. Resolves to `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut state = self.shared.state.lock().expect("ring channel lock");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Non-blocking pop, for tests and shutdown drains.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared
            .state
            .lock()
            .expect("ring channel lock")
            .items
            .pop_front()
    }
}
