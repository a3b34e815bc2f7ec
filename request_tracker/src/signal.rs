// Copyright 2024 Keel Build contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::pin;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;

use tokio::sync::Notify;

///
/// A shared cancellation flag, installed on the tracker and consulted after every request body
/// returns. Aborting is sticky: once the flag is set it stays set for the signal's lifetime, and
/// every waiter past or future observes it.
///
#[derive(Clone)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> AbortSignal {
        AbortSignal {
            state: Arc::new(AbortState {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    ///
    /// Aborts the build, releasing any task waiting in `aborted`. All calls after the first are
    /// noops.
    ///
    pub fn abort(&self) {
        if !self.state.aborted.swap(true, atomic::Ordering::SeqCst) {
            self.state.notify.notify_waiters();
        }
    }

    ///
    /// Waits for another task to abort the build. Returns immediately if it already has.
    ///
    pub async fn aborted(&self) {
        // Register with the Notify before re-checking the flag: an abort landing between the
        // check and the await would otherwise be missed, as notify_waiters only wakes tasks
        // that are already registered.
        let mut notified = pin!(self.state.notify.notified());
        notified.as_mut().enable();
        if self.state.aborted.load(atomic::Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    ///
    /// Returns true if the signal has been aborted.
    ///
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(atomic::Ordering::SeqCst)
    }
}
