//! Timeout notifier task
//!
//! Watchlist state is only ever touched by its owning thread. The notifier
//! runs on the tokio runtime, sleeps until the watchlist's next timer
//! deadline and posts an [`ExpiryNotice`] on a channel. The owner awaits the
//! channel and calls `Watchlist::dispatch()`, which is where the timeout
//! work actually happens.

use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A deadline has passed; the owner should dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryNotice {
    pub deadline: Instant,
}

/// Background deadline watcher.
///
/// Must be created inside a tokio runtime. The task stops when the notifier
/// or the notice receiver is dropped.
#[derive(Debug)]
pub struct TimeoutNotifier {
    deadline_tx: watch::Sender<Option<Instant>>,
    task: JoinHandle<()>,
}

impl TimeoutNotifier {
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<ExpiryNotice>) {
        let (deadline_tx, deadline_rx) = watch::channel(None);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(deadline_rx, notice_tx));
        (Self { deadline_tx, task }, notice_rx)
    }

    /// Publish the next deadline, or `None` when no timer is running.
    pub fn schedule(&self, deadline: Option<Instant>) {
        self.deadline_tx.send_if_modified(|current| {
            if *current == deadline {
                false
            } else {
                *current = deadline;
                true
            }
        });
    }

    /// Deadline currently being watched
    pub fn scheduled(&self) -> Option<Instant> {
        *self.deadline_tx.borrow()
    }
}

impl Drop for TimeoutNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut deadline_rx: watch::Receiver<Option<Instant>>,
    notice_tx: mpsc::UnboundedSender<ExpiryNotice>,
) {
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        match deadline {
            None => {
                if deadline_rx.changed().await.is_err() {
                    break;
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        trace!("Timer deadline reached");
                        if notice_tx.send(ExpiryNotice { deadline }).is_err() {
                            break;
                        }
                        // Fire once per published deadline.
                        if deadline_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Timeout notifier stopped");
}
