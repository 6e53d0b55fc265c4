//! Building blocks shared by client and server sessions.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, Notify};

use crate::error::Error;

/// Sending side of a session's single-slot error channel.
///
/// The first reported error is kept until consumed; anything reported while
/// the slot is occupied is dropped, not queued.
#[derive(Clone)]
pub(crate) struct ErrorSlot {
    tx: mpsc::Sender<Error>,
}

impl ErrorSlot {
    /// Create the slot and the receiver that consumes it.
    pub(crate) fn new() -> (Self, mpsc::Receiver<Error>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Report `err`; returns false when it was dropped.
    pub(crate) fn report(&self, err: Error) -> bool {
        self.tx.try_send(err).is_ok()
    }
}

/// One-way "direction finished" flag that can be awaited.
#[derive(Default)]
pub(crate) struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub(crate) fn mark(&self) {
        if !self.set.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Termination flags guarding against duplicate `End` frames.
#[derive(Default)]
pub(crate) struct EndFlags {
    /// This side already told the peer it is done.
    notified_peer: AtomicBool,
    /// The peer ended the session with the error option.
    peer_errored: AtomicBool,
}

impl EndFlags {
    /// Claim the right to send this side's `End` frame. True exactly once.
    pub(crate) fn claim_notify(&self) -> bool {
        !self.notified_peer.swap(true, Ordering::AcqRel)
    }

    /// Claim the right to send an `End` with error: only when the peer has
    /// not already reported an error end and nothing was sent yet.
    pub(crate) fn claim_error_notify(&self) -> bool {
        !self.peer_errored() && self.claim_notify()
    }

    pub(crate) fn mark_peer_errored(&self) {
        self.peer_errored.store(true, Ordering::Release);
    }

    pub(crate) fn peer_errored(&self) -> bool {
        self.peer_errored.load(Ordering::Acquire)
    }
}
