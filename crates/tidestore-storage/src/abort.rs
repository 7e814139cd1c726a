//! Generation abort signal.
//!
//! Each generation owns one [`AbortSignal`]. Any worker may raise it; the
//! first reason is kept and later ones are ignored. Workers hold an
//! [`AbortListener`] and race their blocking operations against it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{FailureClass, StorageError};

/// Why a generation was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A consumer or synchronizer failed.
    WorkerFailure {
        partition: u32,
        class: FailureClass,
        message: String,
    },
    /// The barrier was not released within the allowed time.
    CommitOverdue { elapsed: Duration },
    /// Offsets could not be committed to the log.
    CommitFailed(String),
    /// The generation could not be started.
    SpawnFailed {
        class: FailureClass,
        message: String,
    },
    /// Graceful stop requested by the owner of the coordinator.
    Shutdown,
}

impl AbortReason {
    pub fn worker(partition: u32, error: &StorageError) -> Self {
        AbortReason::WorkerFailure {
            partition,
            class: error.class(),
            message: error.to_string(),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            AbortReason::WorkerFailure { class, .. } if class.resets_store() => "store_failure",
            AbortReason::WorkerFailure { .. } => "worker_failure",
            AbortReason::CommitOverdue { .. } => "commit_overdue",
            AbortReason::CommitFailed(_) => "commit_failed",
            AbortReason::SpawnFailed { .. } => "spawn_failed",
            AbortReason::Shutdown => "shutdown",
        }
    }

    pub fn resets_store(&self) -> bool {
        match self {
            AbortReason::WorkerFailure { class, .. } | AbortReason::SpawnFailed { class, .. } => {
                class.resets_store()
            }
            AbortReason::CommitOverdue { .. } => true,
            AbortReason::CommitFailed(_) | AbortReason::Shutdown => false,
        }
    }
}

pub struct AbortSignal {
    tx: watch::Sender<bool>,
    reason: Mutex<Option<AbortReason>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            reason: Mutex::new(None),
        }
    }

    /// Raise the signal. Returns true if this call set the reason.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let first = {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.tx.send_replace(true);
        first
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn listener(&self) -> AbortListener {
        AbortListener {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct AbortListener {
    rx: watch::Receiver<bool>,
}

impl AbortListener {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised (or its owner is gone).
    pub async fn aborted(&mut self) {
        let _ = self.rx.wait_for(|aborted| *aborted).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = AbortSignal::new();
        let mut listener = signal.listener();
        assert!(!listener.is_aborted());

        assert!(signal.abort(AbortReason::CommitOverdue {
            elapsed: Duration::from_secs(3)
        }));
        assert!(!signal.abort(AbortReason::Shutdown));

        listener.aborted().await;
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().unwrap().label(), "commit_overdue");
    }

    #[tokio::test]
    async fn test_listener_wakes_on_abort() {
        let signal = std::sync::Arc::new(AbortSignal::new());
        let mut listener = signal.listener();

        let waiter = tokio::spawn(async move {
            listener.aborted().await;
        });
        signal.abort(AbortReason::Shutdown);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_store_failures_reset_the_store() {
        let store = AbortReason::worker(0, &StorageError::BatchRejected { failed: 1, total: 1 });
        assert!(store.resets_store());
        assert_eq!(store.label(), "store_failure");

        let partition = AbortReason::worker(0, &StorageError::Unimplemented("archive"));
        assert!(!partition.resets_store());
        assert_eq!(partition.label(), "worker_failure");
    }
}
