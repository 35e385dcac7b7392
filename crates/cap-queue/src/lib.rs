// SPDX-License-Identifier: MIT OR Apache-2.0
//! Priority-based job queues bridging the daemon to out-of-process capture
//! workers (§4.7: Queue & Worker Bridge).
//!
//! Two named queues exist, one per job kind. Workers are out of scope here;
//! this crate only models the contract a worker must honor: pick up a
//! waiting entry, mark it active, and eventually report completion or
//! failure.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which named queue a job belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Screenshot capture jobs.
    Screenshot,
    /// PDF render jobs.
    Pdf,
}

impl QueueName {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Pdf => "pdf",
        }
    }
}

/// Lifecycle state of a queued job, independent of the repository's own
/// `PENDING/PROCESSING/COMPLETED/FAILED` job-row state machine: this one
/// tracks queue membership, the row tracks business state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, not yet picked up by a worker.
    Waiting,
    /// Picked up by a worker and in progress.
    Active,
    /// Worker reported success.
    Completed,
    /// Worker reported failure.
    Failed,
    /// Scheduled for later (not currently used by the synchronous pipeline,
    /// reserved for future retry backoff).
    Delayed,
}

/// Errors returned by queue operations.
#[derive(Debug)]
pub enum QueueError {
    /// The queue has reached its maximum capacity.
    Full {
        /// Maximum number of items the queue can hold.
        max: usize,
    },
    /// A job with the given ID is already enqueued.
    DuplicateId(String),
    /// No entry with the given ID exists in the queue.
    NotFound(String),
    /// The requested transition is not valid from the entry's current state.
    InvalidTransition {
        /// The job id being transitioned.
        id: String,
        /// The state it was in.
        from: JobState,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { max } => write!(f, "queue is full (max {max})"),
            Self::DuplicateId(id) => write!(f, "duplicate queue entry: {id}"),
            Self::NotFound(id) => write!(f, "no such queue entry: {id}"),
            Self::InvalidTransition { id, from } => {
                write!(f, "entry {id} cannot transition from {from:?}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

/// A job waiting in, or moving through, a [`JobQueue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue-assigned identifier (`{kind}_{unix_ms}_{random9}`).
    pub id: String,
    /// Opaque payload the worker needs to execute the job.
    pub payload: serde_json::Value,
    /// Scheduling priority: 1 (highest) .. 10 (lowest).
    pub priority: u8,
    /// Current lifecycle state.
    pub state: JobState,
    /// Worker-reported progress, 0-100.
    pub progress: Option<u8>,
    /// Worker-reported result payload, set on completion.
    pub result: Option<serde_json::Value>,
    /// Worker-reported error, set on failure.
    pub error: Option<String>,
    /// Number of times this entry has been (re)tried.
    pub attempts: u32,
    /// Unix-millis timestamp of initial enqueue.
    pub created_at: u64,
}

/// Snapshot statistics for a [`JobQueue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of entries currently tracked (including terminal ones not yet cleaned).
    pub total: usize,
    /// Maximum queue capacity.
    pub max: usize,
    /// Breakdown of entries per state.
    pub by_state: BTreeMap<String, usize>,
}

fn state_key(state: JobState) -> &'static str {
    match state {
        JobState::Waiting => "waiting",
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Delayed => "delayed",
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn generate_id(kind: QueueName) -> String {
    let rand_suffix: u32 = rand::thread_rng().gen_range(100_000_000..999_999_999);
    format!("{}_{}_{}", kind.prefix(), now_millis(), rand_suffix)
}

/// A single named, bounded, priority-aware job queue.
///
/// Dequeue picks the lowest-numbered (highest) priority first; ties break
/// FIFO by `created_at`.
pub struct JobQueue {
    name: QueueName,
    entries: Vec<QueueEntry>,
    max_size: usize,
}

impl JobQueue {
    /// Create a new named queue with the given maximum capacity.
    pub fn new(name: QueueName, max_size: usize) -> Self {
        Self {
            name,
            entries: Vec::new(),
            max_size,
        }
    }

    /// Submit a job payload at the given priority (1 high .. 10 low,
    /// clamped). Returns the assigned queue id.
    pub fn add_job(&mut self, payload: serde_json::Value, priority: u8) -> Result<String, QueueError> {
        if self.entries.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }
        let id = generate_id(self.name);
        let entry = QueueEntry {
            id: id.clone(),
            payload,
            priority: priority.clamp(1, 10),
            state: JobState::Waiting,
            progress: None,
            result: None,
            error: None,
            attempts: 0,
            created_at: now_millis(),
        };
        self.entries.push(entry);
        Ok(id)
    }

    /// Look up the current status of a job by id.
    pub fn get_status(&self, id: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Pop the next waiting job, highest priority first, FIFO within a
    /// priority tier, and mark it active.
    pub fn dequeue_next(&mut self) -> Option<&QueueEntry> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == JobState::Waiting)
            .min_by_key(|(_, e)| (e.priority, e.created_at))
            .map(|(i, _)| i)?;
        self.entries[idx].state = JobState::Active;
        self.entries[idx].attempts += 1;
        Some(&self.entries[idx])
    }

    /// Record a successful completion.
    pub fn mark_completed(
        &mut self,
        id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let entry = self.find_mut(id)?;
        entry.state = JobState::Completed;
        entry.result = Some(result);
        entry.progress = Some(100);
        Ok(())
    }

    /// Record a failure.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Result<(), QueueError> {
        let entry = self.find_mut(id)?;
        entry.state = JobState::Failed;
        entry.error = Some(error.into());
        Ok(())
    }

    /// Cancel a job. Only valid while `Waiting` or `Delayed`; active jobs
    /// are removed best-effort (the worker is expected to notice the
    /// missing entry and abort).
    pub fn cancel(&mut self, id: &str) -> Result<(), QueueError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Retry a failed job: resets it to `Waiting` in place, preserving
    /// `attempts`. Only valid from `Failed`.
    pub fn retry(&mut self, id: &str) -> Result<(), QueueError> {
        let entry = self.find_mut(id)?;
        if entry.state != JobState::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: entry.state,
            });
        }
        entry.state = JobState::Waiting;
        entry.error = None;
        entry.progress = None;
        Ok(())
    }

    /// Remove terminal (`Completed`/`Failed`) entries older than `grace_ms`,
    /// capped at `limit` removals. Returns the number removed.
    pub fn clean(&mut self, grace_ms: u64, limit: usize) -> usize {
        let cutoff = now_millis().saturating_sub(grace_ms);
        let mut removed = 0;
        self.entries.retain(|e| {
            if removed >= limit {
                return true;
            }
            let terminal = matches!(e.state, JobState::Completed | JobState::Failed);
            if terminal && e.created_at < cutoff {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Snapshot statistics for this queue.
    pub fn stats(&self) -> QueueStats {
        let mut by_state = BTreeMap::new();
        for entry in &self.entries {
            *by_state.entry(state_key(entry.state).to_string()).or_insert(0usize) += 1;
        }
        QueueStats {
            total: self.entries.len(),
            max: self.max_size,
            by_state,
        }
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut QueueEntry, QueueError> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }
}

/// Bridges the daemon to the two named job queues.
pub struct QueueBridge {
    screenshot: JobQueue,
    pdf: JobQueue,
}

impl QueueBridge {
    /// Create a bridge with the given per-queue capacity.
    pub fn new(max_size_per_queue: usize) -> Self {
        Self {
            screenshot: JobQueue::new(QueueName::Screenshot, max_size_per_queue),
            pdf: JobQueue::new(QueueName::Pdf, max_size_per_queue),
        }
    }

    fn queue_mut(&mut self, name: QueueName) -> &mut JobQueue {
        match name {
            QueueName::Screenshot => &mut self.screenshot,
            QueueName::Pdf => &mut self.pdf,
        }
    }

    fn queue(&self, name: QueueName) -> &JobQueue {
        match name {
            QueueName::Screenshot => &self.screenshot,
            QueueName::Pdf => &self.pdf,
        }
    }

    /// Submit a screenshot job.
    pub fn add_screenshot_job(
        &mut self,
        payload: serde_json::Value,
        priority: u8,
    ) -> Result<String, QueueError> {
        self.screenshot.add_job(payload, priority)
    }

    /// Submit a PDF job.
    pub fn add_pdf_job(
        &mut self,
        payload: serde_json::Value,
        priority: u8,
    ) -> Result<String, QueueError> {
        self.pdf.add_job(payload, priority)
    }

    /// Look up a job's status in the named queue.
    pub fn get_status(&self, name: QueueName, id: &str) -> Option<&QueueEntry> {
        self.queue(name).get_status(id)
    }

    /// Cancel a job in the named queue.
    pub fn cancel(&mut self, name: QueueName, id: &str) -> Result<(), QueueError> {
        self.queue_mut(name).cancel(id)
    }

    /// Retry a failed job in the named queue.
    pub fn retry(&mut self, name: QueueName, id: &str) -> Result<(), QueueError> {
        self.queue_mut(name).retry(id)
    }

    /// Stats for the named queue.
    pub fn stats(&self, name: QueueName) -> QueueStats {
        self.queue(name).stats()
    }

    /// Prune terminal entries from the named queue.
    pub fn clean(&mut self, name: QueueName, grace_ms: u64, limit: usize) -> usize {
        self.queue_mut(name).clean(grace_ms, limit)
    }

    /// Pop the next waiting job from the named queue for a worker to process.
    pub fn dequeue_next(&mut self, name: QueueName) -> Option<QueueEntry> {
        self.queue_mut(name).dequeue_next().cloned()
    }

    /// Record a job's successful completion in the named queue.
    pub fn mark_completed(
        &mut self,
        name: QueueName,
        id: &str,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.queue_mut(name).mark_completed(id, result)
    }

    /// Record a job's failure in the named queue.
    pub fn mark_failed(
        &mut self,
        name: QueueName,
        id: &str,
        error: impl Into<String>,
    ) -> Result<(), QueueError> {
        self.queue_mut(name).mark_failed(id, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_assigns_prefixed_id() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let id = q.add_job(json!({"url": "https://example.com"}), 5).unwrap();
        assert!(id.starts_with("screenshot_"));
        assert_eq!(q.get_status(&id).unwrap().state, JobState::Waiting);
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let mut q = JobQueue::new(QueueName::Pdf, 1);
        q.add_job(json!({}), 5).unwrap();
        let err = q.add_job(json!({}), 5).unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 1 }));
    }

    #[test]
    fn dequeue_prefers_higher_priority() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let low = q.add_job(json!({"n": 1}), 9).unwrap();
        let high = q.add_job(json!({"n": 2}), 1).unwrap();
        let next = q.dequeue_next().unwrap();
        assert_eq!(next.id, high);
        assert_ne!(next.id, low);
        assert_eq!(next.state, JobState::Active);
    }

    #[test]
    fn dequeue_breaks_ties_fifo() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let first = q.add_job(json!({}), 5).unwrap();
        let second = q.add_job(json!({}), 5).unwrap();
        assert_eq!(q.dequeue_next().unwrap().id, first);
        assert_eq!(q.dequeue_next().unwrap().id, second);
    }

    #[test]
    fn priority_is_clamped() {
        let mut q = JobQueue::new(QueueName::Pdf, 10);
        let id = q.add_job(json!({}), 255).unwrap();
        assert_eq!(q.get_status(&id).unwrap().priority, 10);
    }

    #[test]
    fn complete_then_cannot_retry_succeeds_only_from_failed() {
        let mut q = JobQueue::new(QueueName::Pdf, 10);
        let id = q.add_job(json!({}), 5).unwrap();
        q.dequeue_next();
        q.mark_completed(&id, json!({"bytes": 10})).unwrap();
        let err = q.retry(&id).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[test]
    fn retry_resets_failed_to_waiting() {
        let mut q = JobQueue::new(QueueName::Pdf, 10);
        let id = q.add_job(json!({}), 5).unwrap();
        q.dequeue_next();
        q.mark_failed(&id, "navigation timeout").unwrap();
        assert_eq!(q.get_status(&id).unwrap().state, JobState::Failed);
        q.retry(&id).unwrap();
        let entry = q.get_status(&id).unwrap();
        assert_eq!(entry.state, JobState::Waiting);
        assert!(entry.error.is_none());
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn cancel_removes_waiting_entry() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let id = q.add_job(json!({}), 5).unwrap();
        q.cancel(&id).unwrap();
        assert!(q.get_status(&id).is_none());
    }

    #[test]
    fn cancel_unknown_id_errors() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let err = q.cancel("nope").unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[test]
    fn stats_breaks_down_by_state() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let a = q.add_job(json!({}), 5).unwrap();
        let b = q.add_job(json!({}), 5).unwrap();
        q.dequeue_next();
        q.mark_completed(&a, json!({})).unwrap();
        let stats = q.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_state["completed"], 1);
        assert_eq!(stats.by_state["waiting"], 1);
        let _ = b;
    }

    #[test]
    fn clean_prunes_old_terminal_entries_only() {
        let mut q = JobQueue::new(QueueName::Screenshot, 10);
        let a = q.add_job(json!({}), 5).unwrap();
        let waiting = q.add_job(json!({}), 5).unwrap();
        q.mark_failed(&a, "boom").ok();
        // grace_ms=0 means "anything older than now", and our entries were
        // just created, so nothing should be pruned yet.
        let removed = q.clean(0, 10);
        assert_eq!(removed, 0);
        assert!(q.get_status(&waiting).is_some());
    }

    #[test]
    fn bridge_routes_by_queue_name() {
        let mut bridge = QueueBridge::new(5);
        let s_id = bridge.add_screenshot_job(json!({}), 3).unwrap();
        let p_id = bridge.add_pdf_job(json!({}), 3).unwrap();
        assert!(s_id.starts_with("screenshot_"));
        assert!(p_id.starts_with("pdf_"));
        assert!(bridge.get_status(QueueName::Screenshot, &s_id).is_some());
        assert!(bridge.get_status(QueueName::Pdf, &p_id).is_some());
        assert!(bridge.get_status(QueueName::Pdf, &s_id).is_none());
    }
}
