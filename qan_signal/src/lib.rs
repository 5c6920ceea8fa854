//! One-shot signals for the query analytics pipeline.
//!
//! The tailing reader must be closable while a parser is blocked inside
//! `next_line`, and the parser must be stoppable while it is blocked handing an
//! event to its consumer. Both are the same shape of problem: a single event
//! that happens at most once, that may be raised from any holder of a shared
//! reference, and that every waiter must observe promptly without another poll
//! cycle elapsing.
//!
//! The mechanism has two components, a `Trigger` and a `Watcher`. The
//! `Trigger` raises the signal, a `Watcher` waits for it. Raising is
//! idempotent: only the first call has any effect and reports so. Dropping
//! every `Trigger` without raising counts as raising, so that an abandoned
//! owner never strands its waiters.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Construct a `Watcher` and `Trigger` pair.
#[must_use]
pub fn signal() -> (Watcher, Trigger) {
    // The watched value is sticky: a watcher created after the signal sees it
    // immediately.
    let (sender, receiver) = watch::channel(false);
    (
        Watcher { receiver },
        Trigger {
            sender: Arc::new(sender),
        },
    )
}

#[derive(Debug, Clone)]
/// Raises the signal for every associated `Watcher`.
pub struct Trigger {
    sender: Arc<watch::Sender<bool>>,
}

impl Trigger {
    /// Raise the signal. Returns `true` if this call raised it, `false` if it
    /// had already been raised.
    pub fn signal(&self) -> bool {
        let raised = self.sender.send_if_modified(|state| {
            if *state {
                false
            } else {
                *state = true;
                true
            }
        });
        if raised {
            debug!(
                "signal raised for {watchers} watchers",
                watchers = self.sender.receiver_count()
            );
        }
        raised
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Create a new `Watcher` for this trigger.
    #[must_use]
    pub fn watcher(&self) -> Watcher {
        Watcher {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
/// Waits for the signal raised by a `Trigger`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if the signal has already been
    /// raised or if every `Trigger` has been dropped.
    ///
    /// This function is cancel safe and may be used in `tokio::select!` any
    /// number of times.
    pub async fn recv(&mut self) {
        // An error here means every sender is gone, which we treat the same as
        // a raised signal.
        let _ = self.receiver.wait_for(|raised| *raised).await;
    }

    /// Check whether the signal has been raised without blocking. A dropped
    /// `Trigger` counts as raised.
    #[must_use]
    pub fn try_recv(&self) -> bool {
        match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow(),
            Err(_) => true,
        }
    }
}
