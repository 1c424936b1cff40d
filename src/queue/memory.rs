//! In-process queue with the same observable semantics as the queue service.
//!
//! Used by tests and by single-process runs. Tasks are served lowest priority
//! first with FIFO order among equal priorities; results are keyed by task id
//! and the last submission wins. Transient failures can be injected per
//! operation to exercise retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::types::{Dequeued, QueueStatus, QueueTask, ResultStatus, TaskResult};
use super::QueueGateway;
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct QueueState {
    name: String,
    /// Undequeued tasks ordered by (priority, arrival).
    pending: BTreeMap<(i32, i64), QueueTask>,
    /// Tasks handed to a worker but without a result yet.
    claimed: HashMap<Uuid, QueueTask>,
    results: HashMap<Uuid, TaskResult>,
}

#[derive(Debug, Default)]
struct Faults {
    status: u32,
    submit: u32,
    dequeue: u32,
    get_result: u32,
    /// Zero-based enqueue call numbers that fail.
    enqueue_at: Vec<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<Uuid, QueueState>,
    seq: i64,
    enqueue_calls: u64,
    submit_calls: u64,
    faults: Faults,
}

/// Thread-safe in-memory [`QueueGateway`].
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

fn take_fault(counter: &mut u32, what: &str) -> Result<(), GatewayError> {
    if *counter > 0 {
        *counter -= 1;
        return Err(GatewayError::Transient(format!("{}: injected failure", what)));
    }
    Ok(())
}

fn queue_not_found(queue_id: Uuid) -> GatewayError {
    GatewayError::NotFound(format!("queue {} does not exist", queue_id))
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panicking holder: every mutation is a single insert/remove.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `n` status calls fail with a transient error.
    pub fn fail_next_status(&self, n: u32) {
        self.lock().faults.status = n;
    }

    /// Make the next `n` result submissions fail with a transient error.
    pub fn fail_next_submits(&self, n: u32) {
        self.lock().faults.submit = n;
    }

    /// Make the next `n` dequeue calls fail with a transient error.
    pub fn fail_next_dequeues(&self, n: u32) {
        self.lock().faults.dequeue = n;
    }

    /// Make the next `n` result lookups fail with a transient error.
    pub fn fail_next_get_results(&self, n: u32) {
        self.lock().faults.get_result = n;
    }

    /// Make the enqueue call with the given zero-based number fail.
    pub fn fail_enqueue_at(&self, call: u64) {
        self.lock().faults.enqueue_at.push(call);
    }

    /// Remove a queue so that later calls observe `NotFound`.
    pub fn delete_queue(&self, queue_id: Uuid) -> bool {
        self.lock().queues.remove(&queue_id).is_some()
    }

    /// Number of queues created so far.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Name a queue was created with.
    pub fn queue_name(&self, queue_id: Uuid) -> Option<String> {
        self.lock().queues.get(&queue_id).map(|q| q.name.clone())
    }

    /// Priorities of undequeued tasks in service order.
    pub fn pending_priorities(&self, queue_id: Uuid) -> Vec<i32> {
        self.lock()
            .queues
            .get(&queue_id)
            .map(|q| q.pending.keys().map(|(priority, _)| *priority).collect())
            .unwrap_or_default()
    }

    /// Total submit calls received, including injected failures.
    pub fn submit_calls(&self) -> u64 {
        self.lock().submit_calls
    }

    /// Put a claimed task back at the front of its priority band.
    ///
    /// Stands in for a visibility timeout so tests can model redelivery.
    pub fn requeue(&self, queue_id: Uuid, task_id: Uuid) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        let task = queue
            .claimed
            .remove(&task_id)
            .ok_or_else(|| GatewayError::NotFound(format!("task {} is not claimed", task_id)))?;
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(queue) = inner.queues.get_mut(&queue_id) {
            queue.pending.insert((task.priority, -seq), task);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueGateway for InMemoryQueue {
    async fn create_queue(&self, name: &str) -> Result<Uuid, GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "queue name cannot be empty".to_string(),
            ));
        }
        let id = Uuid::new_v4();
        self.lock().queues.insert(
            id,
            QueueState {
                name: name.to_string(),
                ..QueueState::default()
            },
        );
        Ok(id)
    }

    async fn enqueue(
        &self,
        queue_id: Uuid,
        params: &str,
        priority: i32,
    ) -> Result<Uuid, GatewayError> {
        let mut inner = self.lock();
        let call = inner.enqueue_calls;
        inner.enqueue_calls += 1;
        if let Some(pos) = inner.faults.enqueue_at.iter().position(|c| *c == call) {
            inner.faults.enqueue_at.remove(pos);
            return Err(GatewayError::Transient("enqueue task: injected failure".to_string()));
        }

        inner.seq += 1;
        let seq = inner.seq;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        let task = QueueTask {
            id: Uuid::new_v4(),
            params: params.to_string(),
            priority,
        };
        let id = task.id;
        queue.pending.insert((priority, seq), task);
        Ok(id)
    }

    async fn dequeue(&self, queue_id: Uuid) -> Result<Dequeued, GatewayError> {
        let mut inner = self.lock();
        take_fault(&mut inner.faults.dequeue, "dequeue task")?;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        match queue.pending.pop_first() {
            Some((_, task)) => {
                queue.claimed.insert(task.id, task.clone());
                Ok(Dequeued::Task(task))
            }
            None => Ok(Dequeued::Empty),
        }
    }

    async fn submit_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        output: &str,
        status: ResultStatus,
    ) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        inner.submit_calls += 1;
        take_fault(&mut inner.faults.submit, "submit result")?;
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        queue.claimed.remove(&task_id);
        queue.results.insert(
            task_id,
            TaskResult {
                task_id,
                output: output.to_string(),
                status,
            },
        );
        Ok(())
    }

    async fn get_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<TaskResult>, GatewayError> {
        let mut inner = self.lock();
        take_fault(&mut inner.faults.get_result, "get result")?;
        let queue = inner
            .queues
            .get(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        Ok(queue.results.get(&task_id).cloned())
    }

    async fn get_status(&self, queue_id: Uuid) -> Result<QueueStatus, GatewayError> {
        let mut inner = self.lock();
        take_fault(&mut inner.faults.status, "get queue status")?;
        let queue = inner
            .queues
            .get(&queue_id)
            .ok_or_else(|| queue_not_found(queue_id))?;
        let outstanding = queue
            .pending
            .values()
            .chain(queue.claimed.values())
            .filter(|task| !queue.results.contains_key(&task.id))
            .count() as u64;
        Ok(QueueStatus {
            pending_count: outstanding,
            completed_count: queue.results.len() as u64,
            has_pending: outstanding > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue_with(tasks: &[(&str, i32)]) -> (InMemoryQueue, Uuid) {
        let queue = InMemoryQueue::new();
        let id = queue.create_queue("pdf-test").await.unwrap();
        for (params, priority) in tasks {
            queue.enqueue(id, params, *priority).await.unwrap();
        }
        (queue, id)
    }

    fn task(dequeued: Dequeued) -> QueueTask {
        match dequeued {
            Dequeued::Task(task) => task,
            Dequeued::Empty => panic!("expected a task"),
        }
    }

    #[tokio::test]
    async fn test_lowest_priority_first_fifo_on_ties() {
        let (queue, id) = queue_with(&[("c", 3), ("a1", 1), ("b", 2), ("a2", 1)]).await;
        assert_eq!(queue.pending_priorities(id), vec![1, 1, 2, 3]);

        let order: Vec<String> = [
            queue.dequeue(id).await.unwrap(),
            queue.dequeue(id).await.unwrap(),
            queue.dequeue(id).await.unwrap(),
            queue.dequeue(id).await.unwrap(),
        ]
        .into_iter()
        .map(|d| task(d).params)
        .collect();
        assert_eq!(order, vec!["a1", "a2", "b", "c"]);
        assert_eq!(queue.dequeue(id).await.unwrap(), Dequeued::Empty);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_not_found() {
        let queue = InMemoryQueue::new();
        let missing = Uuid::new_v4();
        assert!(queue.dequeue(missing).await.unwrap_err().is_not_found());
        assert!(queue.get_status(missing).await.unwrap_err().is_not_found());
        assert!(queue
            .enqueue(missing, "{}", 1)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_status_counts_claimed_tasks_as_pending() {
        let (queue, id) = queue_with(&[("a", 1), ("b", 2)]).await;
        let first = task(queue.dequeue(id).await.unwrap());

        let status = queue.get_status(id).await.unwrap();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.completed_count, 0);

        queue
            .submit_result(id, first.id, "/tmp/a.json", ResultStatus::Success)
            .await
            .unwrap();
        let status = queue.get_status(id).await.unwrap();
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.completed_count, 1);
        assert!(status.has_pending);
    }

    #[tokio::test]
    async fn test_get_result_absent_then_stable() {
        let (queue, id) = queue_with(&[("a", 1)]).await;
        let t = task(queue.dequeue(id).await.unwrap());
        assert_eq!(queue.get_result(id, t.id).await.unwrap(), None);

        queue
            .submit_result(id, t.id, "boom", ResultStatus::Failure)
            .await
            .unwrap();
        let first = queue.get_result(id, t.id).await.unwrap();
        let second = queue.get_result(id, t.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.map(|r| r.status), Some(ResultStatus::Failure));
    }

    #[tokio::test]
    async fn test_last_submission_wins() {
        let (queue, id) = queue_with(&[("a", 1)]).await;
        let t = task(queue.dequeue(id).await.unwrap());
        queue
            .submit_result(id, t.id, "first", ResultStatus::Failure)
            .await
            .unwrap();
        queue
            .submit_result(id, t.id, "second", ResultStatus::Success)
            .await
            .unwrap();

        let result = queue.get_result(id, t.id).await.unwrap().unwrap();
        assert_eq!(result.output, "second");
        assert_eq!(queue.get_status(id).await.unwrap().completed_count, 1);
    }

    #[tokio::test]
    async fn test_completion_is_monotonic() {
        let (queue, id) = queue_with(&[("a", 1), ("b", 2), ("c", 3)]).await;
        let mut claimed = Vec::new();
        while let Dequeued::Task(t) = queue.dequeue(id).await.unwrap() {
            claimed.push(t.id);
        }
        for task_id in &claimed {
            queue
                .submit_result(id, *task_id, "/tmp/out.json", ResultStatus::Success)
                .await
                .unwrap();
        }

        let done = queue.get_status(id).await.unwrap();
        assert!(done.is_complete(3));

        queue
            .submit_result(id, claimed[1], "late failure", ResultStatus::Failure)
            .await
            .unwrap();
        let again = queue.get_status(id).await.unwrap();
        assert!(again.is_complete(3));
        assert_eq!(again.completed_count, done.completed_count);
        assert_eq!(again.pending_count, 0);
        assert_eq!(
            queue.get_result(id, claimed[1]).await.unwrap().map(|r| r.status),
            Some(ResultStatus::Failure)
        );
    }

    #[tokio::test]
    async fn test_injected_faults_are_transient_and_finite() {
        let (queue, id) = queue_with(&[]).await;
        queue.fail_next_status(2);
        assert!(queue.get_status(id).await.unwrap_err().is_transient());
        assert!(queue.get_status(id).await.unwrap_err().is_transient());
        assert!(queue.get_status(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_fault_at_call() {
        let queue = InMemoryQueue::new();
        let id = queue.create_queue("q").await.unwrap();
        queue.fail_enqueue_at(1);
        assert!(queue.enqueue(id, "a", 1).await.is_ok());
        assert!(queue.enqueue(id, "b", 2).await.unwrap_err().is_transient());
        assert!(queue.enqueue(id, "c", 3).await.is_ok());
        assert_eq!(queue.pending_priorities(id), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_claimed_task() {
        let (queue, id) = queue_with(&[("a", 1), ("b", 1)]).await;
        let first = task(queue.dequeue(id).await.unwrap());
        queue.requeue(id, first.id).unwrap();
        let again = task(queue.dequeue(id).await.unwrap());
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_deleted_queue_is_not_found() {
        let (queue, id) = queue_with(&[("a", 1)]).await;
        assert!(queue.delete_queue(id));
        assert!(queue.dequeue(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_queue_name_rejected() {
        let queue = InMemoryQueue::new();
        let err = queue.create_queue("  ").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
