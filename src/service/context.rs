//! Per-call state handed to every service method.

use tokio::sync::watch;

use crate::metadata::{self, Metadata};

/// Fires the cancellation signal of one call.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes whether the peer has cancelled the call.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx })
    }

    /// A signal that never fires.
    #[cfg(test)]
    pub fn never() -> Cancellation {
        let (_handle, cancellation) = Cancellation::new();
        cancellation
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the call is cancelled; pends forever otherwise.
    pub async fn cancelled(&mut self) {
        let closed = self.rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            // Handle dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

/// Inbound metadata, outbound trailers and cancellation for one call.
#[derive(Debug)]
pub struct CallContext {
    metadata: Metadata,
    trailers: Metadata,
    cancellation: Cancellation,
}

impl CallContext {
    pub fn new(metadata: Metadata, cancellation: Cancellation) -> Self {
        CallContext {
            metadata,
            trailers: Metadata::new(),
            cancellation,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    pub fn into_trailers(self) -> Metadata {
        self.trailers
    }

    /// Echo the inbound `showcase-trailer` values as outbound trailers.
    pub fn echo_trailers(&mut self) {
        metadata::echo_trailers(&self.metadata, &mut self.trailers);
    }

    pub fn cancellation(&mut self) -> &mut Cancellation {
        &mut self.cancellation
    }
}
