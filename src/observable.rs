//! Observable values.
//!
//! Thin reactive wrapper over `tokio::sync::watch` used to publish
//! connection state, status text and the measured sample rate to any number
//! of subscribers (UI bindings, loggers, tests) without coupling the driver
//! to a particular frontend. Reads are synchronous; subscribers await
//! changes without polling.

use tokio::sync::watch;

/// A shared value whose updates notify every subscriber.
///
/// Cloning an `Observable` is cheap and all clones publish into the same
/// channel. The last written value is always retained, so late subscribers
/// immediately observe the current state.
#[derive(Debug)]
pub struct Observable<T> {
    sender: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// Create an observable holding `initial`.
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replace the value and notify all subscribers, whether or not the
    /// value actually changed.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to future updates. The receiver also exposes the current
    /// value via `borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
