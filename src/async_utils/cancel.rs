//! Cooperative cancellation for long runs.
//!
//! Cancelling a run stops us from starting new pages. Pages that are already
//! in flight are allowed to finish, because we have usually paid for their API
//! calls already.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};

use crate::prelude::*;

/// A cloneable cancellation flag.
#[derive(Clone, Debug)]
pub struct Cancellation {
    /// Kept alive so that receivers never see a closed channel.
    tx: Arc<watch::Sender<bool>>,

    /// Our view of the flag.
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Create a new, uncancelled flag.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // The sender is gone, so nobody can cancel us anymore.
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Cancel when the user presses Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupted: finishing in-flight pages, then writing output");
                    this.cancel();
                }
                Err(err) => {
                    debug!("Could not listen for Ctrl-C: {err}");
                }
            }
        })
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
