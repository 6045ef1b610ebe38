//! Ready queue: in-memory ordered set of task ids eligible for dispatch.
//!
//! The queue is a cache of the `pending` rows in the store and can be rebuilt
//! from them at any time. Each operation takes the queue lock for its own
//! in-memory step only; callers never hold it across a store call.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;
use tracing::debug;

use super::model::TaskId;

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<TaskId>,
    members: HashSet<TaskId>,
}

/// FIFO of dispatchable task ids without duplicates.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    inner: Mutex<Inner>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` at the tail. Returns false if it was already queued.
    pub async fn enqueue(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(id) {
            debug!(task_id = id, "Task already queued");
            return false;
        }
        inner.order.push_back(id);
        true
    }

    /// Remove and return the head. Two concurrent callers never get the same id.
    pub async fn claim_head(&self) -> Option<TaskId> {
        let mut inner = self.inner.lock().await;
        let id = inner.order.pop_front()?;
        inner.members.remove(&id);
        Some(id)
    }

    /// Append a recovered or re-submitted task at the tail.
    pub async fn requeue(&self, id: TaskId) -> bool {
        self.enqueue(id).await
    }

    /// Put a just-claimed id back at the head, keeping arrival order.
    pub async fn restore_head(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.members.insert(id) {
            return false;
        }
        inner.order.push_front(id);
        true
    }

    /// Replace the contents. Duplicates in `ids` keep their first position.
    pub async fn rebuild<I>(&self, ids: I)
    where
        I: IntoIterator<Item = TaskId>,
    {
        let mut order = VecDeque::new();
        let mut members = HashSet::new();
        for id in ids {
            if members.insert(id) {
                order.push_back(id);
            }
        }
        let mut inner = self.inner.lock().await;
        inner.order = order;
        inner.members = members;
    }

    /// Ids in dispatch order, without claiming anything.
    pub async fn snapshot(&self) -> Vec<TaskId> {
        self.inner.lock().await.order.iter().copied().collect()
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.inner.lock().await.members.contains(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn enqueue_and_claim_in_order() {
        let queue = ReadyQueue::new();
        assert!(queue.is_empty().await);

        queue.enqueue(1).await;
        queue.enqueue(2).await;
        queue.enqueue(3).await;
        assert_eq!(queue.len().await, 3);

        assert_eq!(queue.claim_head().await, Some(1));
        assert_eq!(queue.claim_head().await, Some(2));
        assert_eq!(queue.claim_head().await, Some(3));
        assert_eq!(queue.claim_head().await, None);
    }

    #[tokio::test]
    async fn enqueue_is_deduplicated() {
        let queue = ReadyQueue::new();
        assert!(queue.enqueue(7).await);
        assert!(!queue.enqueue(7).await);
        assert!(!queue.requeue(7).await);
        assert_eq!(queue.snapshot().await, vec![7]);
    }

    #[tokio::test]
    async fn claimed_id_can_be_requeued_at_tail() {
        let queue = ReadyQueue::new();
        queue.enqueue(1).await;
        queue.enqueue(2).await;

        let head = queue.claim_head().await.unwrap();
        assert!(!queue.contains(head).await);
        assert!(queue.requeue(head).await);
        assert_eq!(queue.snapshot().await, vec![2, 1]);
    }

    #[tokio::test]
    async fn restore_head_keeps_position() {
        let queue = ReadyQueue::new();
        queue.enqueue(1).await;
        queue.enqueue(2).await;

        let head = queue.claim_head().await.unwrap();
        queue.restore_head(head).await;
        assert_eq!(queue.snapshot().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn rebuild_replaces_contents() {
        let queue = ReadyQueue::new();
        queue.enqueue(99).await;

        queue.rebuild(vec![3, 1, 3, 2]).await;
        assert_eq!(queue.snapshot().await, vec![3, 1, 2]);
        assert!(!queue.contains(99).await);

        // Same input, same queue.
        queue.rebuild(vec![3, 1, 3, 2]).await;
        assert_eq!(queue.snapshot().await, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_an_id() {
        let queue = Arc::new(ReadyQueue::new());
        for id in 0..200 {
            queue.enqueue(id).await;
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let q = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(id) = q.claim_head().await {
                    claimed.push(id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }
}
