//! Commit Barrier
//!
//! Rendezvous between the flush synchronizers of a generation and the commit
//! coordinator:
//!
//! ```text
//!  synchronizer 0 ──arrive(flushed=41)──┐
//!  synchronizer 1 ──arrive(flushed=17)──┼──► coordinator sees all arrived
//!  synchronizer N ──arrive(flushed=..)──┘     commits offsets, release()
//!                 ◄────────────── released ─────────┘
//! ```
//!
//! Arrived synchronizers stay blocked until the coordinator releases them, so
//! the flushed offsets they reported cannot move while the commit is in
//! flight. Breaking the barrier wakes every waiter; a broken barrier is never
//! reused, the next generation builds a fresh one.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tidestore_observability::metrics;
use tokio::sync::{watch, Notify};

use crate::log::PartitionOffset;

/// Result of waiting at the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWait {
    Released,
    Broken,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Phase {
    epoch: u64,
    broken: bool,
}

pub struct CommitBarrier {
    parties: usize,
    waiting: Mutex<BTreeMap<u32, Option<u64>>>,
    phase: watch::Sender<Phase>,
    arrivals: Notify,
}

impl CommitBarrier {
    /// Barrier for `parties` synchronizers (the coordinator is not counted).
    pub fn new(parties: usize) -> Self {
        let (phase, _rx) = watch::channel(Phase {
            epoch: 0,
            broken: false,
        });
        Self {
            parties,
            waiting: Mutex::new(BTreeMap::new()),
            phase,
            arrivals: Notify::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Report the partition's flushed offset and wait for the coordinator.
    pub async fn arrive(&self, partition: u32, flushed: Option<u64>, timeout: Duration) -> BarrierWait {
        let mut rx = self.phase.subscribe();
        let epoch = {
            let phase = *rx.borrow_and_update();
            if phase.broken {
                return BarrierWait::Broken;
            }
            self.lock_waiting().insert(partition, flushed);
            phase.epoch
        };
        metrics::BARRIER_SYNCS_TOTAL.inc();
        self.arrivals.notify_one();

        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|phase| phase.broken || phase.epoch > epoch),
        )
        .await;

        match waited {
            Ok(Ok(phase)) if phase.epoch > epoch => BarrierWait::Released,
            Ok(_) => BarrierWait::Broken,
            Err(_) => {
                // Leave only if the coordinator has not released us meanwhile
                let phase = *self.phase.borrow();
                if phase.epoch > epoch {
                    return BarrierWait::Released;
                }
                self.lock_waiting().remove(&partition);
                BarrierWait::TimedOut
            }
        }
    }

    pub fn waiting(&self) -> usize {
        self.lock_waiting().len()
    }

    pub fn all_arrived(&self) -> bool {
        self.waiting() >= self.parties
    }

    /// Offsets to commit for the partitions currently waiting.
    pub fn arrived_offsets(&self) -> Vec<PartitionOffset> {
        self.lock_waiting()
            .iter()
            .filter_map(|(&partition, flushed)| {
                flushed.map(|offset| PartitionOffset::after(partition, offset))
            })
            .collect()
    }

    /// Release every waiting synchronizer.
    pub fn release(&self) {
        self.lock_waiting().clear();
        self.phase.send_modify(|phase| phase.epoch += 1);
    }

    /// Wake every waiter with `Broken`; later arrivals return immediately.
    pub fn break_barrier(&self) {
        self.phase.send_modify(|phase| phase.broken = true);
        self.arrivals.notify_waiters();
    }

    pub fn is_broken(&self) -> bool {
        self.phase.borrow().broken
    }

    /// Wait for the next arrival, at most `max_wait`.
    pub async fn wait_for_arrivals(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.arrivals.notified()).await;
    }

    fn lock_waiting(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, Option<u64>>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_after_all_arrive() {
        let barrier = Arc::new(CommitBarrier::new(2));

        let b0 = barrier.clone();
        let w0 = tokio::spawn(async move { b0.arrive(0, Some(9), Duration::from_secs(5)).await });
        let b1 = barrier.clone();
        let w1 = tokio::spawn(async move { b1.arrive(1, None, Duration::from_secs(5)).await });

        while !barrier.all_arrived() {
            barrier.wait_for_arrivals(Duration::from_millis(10)).await;
        }

        assert_eq!(
            barrier.arrived_offsets(),
            vec![PartitionOffset {
                partition: 0,
                offset: 10
            }]
        );
        barrier.release();

        assert_eq!(w0.await.unwrap(), BarrierWait::Released);
        assert_eq!(w1.await.unwrap(), BarrierWait::Released);
        assert_eq!(barrier.waiting(), 0);
    }

    #[tokio::test]
    async fn test_break_wakes_waiters() {
        let barrier = Arc::new(CommitBarrier::new(2));
        let b0 = barrier.clone();
        let waiter = tokio::spawn(async move { b0.arrive(0, Some(1), Duration::from_secs(5)).await });

        while barrier.waiting() == 0 {
            barrier.wait_for_arrivals(Duration::from_millis(10)).await;
        }
        barrier.break_barrier();

        assert_eq!(waiter.await.unwrap(), BarrierWait::Broken);
        assert_eq!(
            barrier.arrive(1, None, Duration::from_secs(5)).await,
            BarrierWait::Broken
        );
    }

    #[tokio::test]
    async fn test_timeout_leaves_barrier() {
        let barrier = CommitBarrier::new(2);
        let result = barrier.arrive(0, Some(3), Duration::from_millis(20)).await;

        assert_eq!(result, BarrierWait::TimedOut);
        assert_eq!(barrier.waiting(), 0);
    }
}
