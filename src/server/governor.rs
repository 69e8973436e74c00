use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::raft::RaftError;

/// Server-wide bound on concurrent outbound snapshot transfers.
///
/// Every group must hold a slot while streaming a snapshot. Requests
/// beyond capacity queue in FIFO order rather than fail, so catch-up is
/// throttled, never denied. The slot is released on every exit path by
/// dropping the [`SnapshotSlot`].
pub struct SnapshotGovernor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// RAII guard for one transfer slot.
pub struct SnapshotSlot {
    _permit: OwnedSemaphorePermit,
}

impl SnapshotGovernor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. Returns [`RaftError::Stopped`] once the
    /// server shuts the governor down.
    pub async fn acquire(&self) -> Result<SnapshotSlot, RaftError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RaftError::Stopped)?;
        Ok(SnapshotSlot { _permit: permit })
    }

    /// Wake all queued waiters with [`RaftError::Stopped`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn acquires_up_to_capacity_then_queues() {
        let governor = SnapshotGovernor::new(2);

        let slot1 = governor.acquire().await.expect("slot 1");
        let _slot2 = governor.acquire().await.expect("slot 2");
        assert_eq!(governor.in_use(), 2);
        assert_eq!(governor.available(), 0);

        // Third request queues instead of failing.
        let pending = timeout(Duration::from_millis(50), governor.acquire()).await;
        assert!(pending.is_err(), "over-capacity acquire should block");

        // Releasing one slot admits exactly one queued waiter.
        drop(slot1);
        let _slot3 = timeout(Duration::from_millis(200), governor.acquire())
            .await
            .expect("acquire after release")
            .expect("slot 3");
        assert_eq!(governor.in_use(), 2);
    }

    #[tokio::test]
    async fn slot_released_when_dropped_mid_failure() {
        let governor = SnapshotGovernor::new(1);
        {
            let _slot = governor.acquire().await.expect("slot");
            assert_eq!(governor.in_use(), 1);
            // Simulated failed transfer: guard dropped by unwinding scope.
        }
        assert_eq!(governor.in_use(), 0);
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_stopped() {
        let governor = SnapshotGovernor::new(1);
        let _slot = governor.acquire().await.expect("slot");

        governor.close();
        match governor.acquire().await {
            Err(RaftError::Stopped) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("closed governor must not hand out slots"),
        }
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped_to_one() {
        let governor = SnapshotGovernor::new(0);
        assert_eq!(governor.capacity(), 1);
        let _slot = governor.acquire().await.expect("slot");
    }
}
