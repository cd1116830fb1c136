//! Typed, strand-bound publish/subscribe.
//!
//! A [`Subscriber`] owns an ordered list of handlers and delivers every
//! notification to each of them on its strand. A handler's return value
//! governs retention: returning false unsubscribes it. Stopping delivers one
//! final notification carrying the stop code and clears the list; later
//! subscriptions fail with [`NetworkError::SubscriberStopped`].
//!
//! Notifications to a single handler are strictly ordered. Nothing is
//! guaranteed about ordering across distinct subscribers.

use crate::error::NetworkError;
use crate::strand::Strand;
use std::sync::{Arc, Mutex};

/// Notification handler. `Ok` carries a published value; `Err` carries the
/// stop code of the final notification.
pub type EventHandler<T> = Box<dyn FnMut(Result<&T, NetworkError>) -> bool + Send>;

struct Inner<T> {
    handlers: Vec<EventHandler<T>>,
    stopped: Option<NetworkError>,
}

/// A strand-bound list of notification handlers.
pub struct Subscriber<T> {
    strand: Strand,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Subscriber {
            strand: self.strand.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> {
    /// Create a subscriber delivering on the given strand.
    pub fn new(strand: Strand) -> Self {
        Subscriber {
            strand,
            inner: Arc::new(Mutex::new(Inner {
                handlers: Vec::new(),
                stopped: None,
            })),
        }
    }

    /// The delivery strand.
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    /// The stop code, once stopped.
    pub fn stop_code(&self) -> Option<NetworkError> {
        self.inner.lock().expect("subscriber poisoned").stopped
    }

    /// Register a handler, in order after all existing handlers.
    pub fn subscribe(&self, handler: EventHandler<T>) -> Result<(), NetworkError> {
        let mut inner = self.inner.lock().expect("subscriber poisoned");

        if inner.stopped.is_some() {
            return Err(NetworkError::SubscriberStopped);
        }

        inner.handlers.push(handler);
        Ok(())
    }

    /// Deliver a value to every registered handler, in subscription order.
    ///
    /// Delivery is asynchronous: the value is handed to the strand and the
    /// call returns immediately. Notifications racing a concurrent stop are
    /// discarded; the final stop notification is the last delivery.
    pub fn notify(&self, value: T) {
        let inner = self.inner.clone();

        self.strand.post(move || {
            // Swap the list out so handlers can subscribe re-entrantly.
            let mut running = {
                let mut inner = inner.lock().expect("subscriber poisoned");
                if inner.stopped.is_some() {
                    return;
                }
                std::mem::take(&mut inner.handlers)
            };

            running.retain_mut(|handler| handler(Ok(&value)));

            // Handlers subscribed during delivery are ordered after survivors.
            let mut inner = inner.lock().expect("subscriber poisoned");
            let appended = std::mem::take(&mut inner.handlers);
            inner.handlers = running;
            inner.handlers.extend(appended);
        });
    }

    /// Stop the subscriber, delivering one final notification with `code`.
    ///
    /// Idempotent: only the first call's code is delivered.
    pub fn stop(&self, code: NetworkError) {
        {
            let mut inner = self.inner.lock().expect("subscriber poisoned");
            if inner.stopped.is_some() {
                return;
            }
            inner.stopped = Some(code);
        }

        let inner = self.inner.clone();
        self.strand.post(move || {
            let handlers = {
                let mut inner = inner.lock().expect("subscriber poisoned");
                std::mem::take(&mut inner.handlers)
            };

            for mut handler in handlers {
                let _ = handler(Err(code));
            }
        });
    }
}
