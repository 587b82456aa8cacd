//! Command requests submitted to the session.

use std::fmt;
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// An opaque command payload plus a completion callback.
///
/// The callback runs exactly once, when the payload has been accepted by the
/// local radio stack. A request that keeps failing is retried, never dropped,
/// so the callback may also never run.
pub struct Request {
    payload: Vec<u8>,
    on_delivered: Option<Callback>,
}

impl Request {
    /// Create a request with a completion callback.
    pub fn new<F>(payload: impl Into<Vec<u8>>, on_delivered: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            payload: payload.into(),
            on_delivered: Some(Box::new(on_delivered)),
        }
    }

    /// Create a request whose delivery is signalled through a oneshot channel.
    pub fn with_notify(payload: impl Into<Vec<u8>>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let request = Self::new(payload, move || {
            let _ = tx.send(());
        });
        (request, rx)
    }

    /// The bytes to write.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Run the completion callback. Consumes the request.
    pub(crate) fn complete(mut self) {
        if let Some(callback) = self.on_delivered.take() {
            callback();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish_non_exhaustive()
    }
}
