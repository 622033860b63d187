//! One-shot promise/pending pair used to hand results from the loop
//! thread back to async callers.

use crate::event_loop::LoopError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Deferred = Box<dyn FnOnce() + Send>;

/// Writer side. Cloned into every code path that may settle it; the first
/// `resolve`/`reject` wins.
pub struct Promise<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// Reader side of a [`Promise`].
#[must_use = "a pending result does nothing unless waited on"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, LoopError>>,
}

struct Slot<T> {
    tx: Option<oneshot::Sender<Result<T, LoopError>>>,
    deferred: Vec<Deferred>,
}

/// Create a connected promise/pending pair.
pub fn promise<T>() -> (Promise<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let slot = Slot {
        tx: Some(tx),
        deferred: Vec::new(),
    };
    (
        Promise {
            slot: Arc::new(Mutex::new(slot)),
        },
        Pending { rx },
    )
}

impl<T> Promise<T> {
    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn reject(&self, err: LoopError) -> bool {
        self.settle(Err(err))
    }

    /// Whether the promise has been settled.
    pub fn is_settled(&self) -> bool {
        self.lock().tx.is_none()
    }

    /// Whether the reader stopped waiting (timed out or dropped) before
    /// the promise was settled.
    pub fn is_abandoned(&self) -> bool {
        self.lock().tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Settle an abandoned promise so its deferred actions run.
    ///
    /// Returns `false` when the reader is still waiting or the promise is
    /// already settled.
    pub fn release_if_abandoned(&self) -> bool {
        if self.is_abandoned() {
            self.settle(Err(LoopError::Abandoned))
        } else {
            false
        }
    }

    /// Register an action to run exactly once when this promise settles,
    /// whichever path settles it. Runs right away if already settled.
    /// If every clone is dropped unsettled the action runs on drop.
    pub fn on_settle<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.lock();
        if slot.tx.is_some() {
            slot.deferred.push(Box::new(action));
            return;
        }
        drop(slot);
        action();
    }

    fn settle(&self, result: Result<T, LoopError>) -> bool {
        let (tx, deferred) = {
            let mut slot = self.lock();
            match slot.tx.take() {
                Some(tx) => (tx, std::mem::take(&mut slot.deferred)),
                None => return false,
            }
        };

        // Deferred actions run before the reader can observe the result.
        for action in deferred {
            action();
        }
        // The reader may be gone already; the result is simply discarded.
        let _ = tx.send(result);
        true
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        for action in self.deferred.drain(..) {
            action();
        }
    }
}

impl<T> Pending<T> {
    /// Wait for the result, giving up after `limit`.
    ///
    /// Expiry abandons the request but does not retract it: whatever was
    /// submitted on the loop may still complete, and its result is dropped.
    pub async fn wait(self, limit: Duration) -> Result<T, LoopError> {
        match tokio::time::timeout(limit, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LoopError::Abandoned),
            Err(_) => Err(LoopError::Timeout(limit)),
        }
    }

    /// Block the current thread until the result arrives.
    ///
    /// Only for synchronous callers outside any async runtime; never call
    /// it on the loop thread.
    pub fn wait_blocking(self) -> Result<T, LoopError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(LoopError::Abandoned),
        }
    }
}
