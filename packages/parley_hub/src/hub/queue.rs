//! Admission queue and backpressure.
//!
//! Each conversation carries a bounded counter of in-flight work:
//! messages still awaiting broadcast, persistence or agent dispatch.
//! When the bound is reached, new work may evict strictly
//! lower-priority outstanding work instead of being rejected. The
//! eviction order is a hard invariant:
//!
//!   System < Agent < Human
//!
//! System notices are dropped first of all, agent turns (regenerable)
//! next, and a human message is rejected with `QueueFull` only once
//! nothing lower-priority remains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;

/// Suggested client retry delay attached to `QueueFull`.
const RETRY_AFTER_SECS: u64 = 2;

/// Priority class of a unit of in-flight work. Ordering is the
/// eviction invariant: lower variants are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobKind {
    System,
    Agent,
    Human,
}

#[derive(Debug)]
struct JobEntry {
    id: u64,
    kind: JobKind,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct QueueInner {
    jobs: VecDeque<JobEntry>,
    next_id: u64,
    limit: usize,
    evictions: u64,
}

/// Bounded admission queue for one conversation.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl AdmissionQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                next_id: 0,
                limit: limit.max(1),
                evictions: 0,
            })),
        }
    }

    /// Admit one unit of work, evicting lower-priority work if the
    /// queue is full. The returned ticket releases its slot on drop
    /// and carries the token that cancels the job if it is later
    /// evicted.
    pub fn admit(&self, kind: JobKind) -> Result<JobTicket, HubError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.jobs.len() >= inner.limit && !evict_one_below(&mut inner, kind) {
            return Err(HubError::QueueFull {
                retry_after_secs: RETRY_AFTER_SECS,
            });
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let cancel = CancellationToken::new();
        inner.jobs.push_back(JobEntry {
            id,
            kind,
            cancel: cancel.clone(),
        });

        Ok(JobTicket {
            id,
            kind,
            cancel,
            queue: self.inner.clone(),
        })
    }

    /// Current number of in-flight jobs.
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .len()
    }

    pub fn limit(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .limit
    }

    /// Total jobs evicted to make room since creation.
    pub fn evictions(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .evictions
    }
}

/// Cancel and remove the oldest job of the lowest priority class
/// strictly below `kind`. Returns false when no such job exists.
fn evict_one_below(inner: &mut QueueInner, kind: JobKind) -> bool {
    let victim = inner
        .jobs
        .iter()
        .enumerate()
        .filter(|(_, job)| job.kind < kind)
        // min_by_key is stable on ties, so among equal priorities the
        // oldest (front-most) job is chosen.
        .min_by_key(|(_, job)| job.kind)
        .map(|(idx, _)| idx);

    match victim {
        Some(idx) => {
            if let Some(job) = inner.jobs.remove(idx) {
                job.cancel.cancel();
                inner.evictions += 1;
            }
            true
        }
        None => false,
    }
}

/// An admitted unit of work. Dropping the ticket releases its queue
/// slot; an evicted ticket's token fires so the owning task can abort.
#[derive(Debug)]
pub struct JobTicket {
    id: u64,
    kind: JobKind,
    cancel: CancellationToken,
    queue: Arc<Mutex<QueueInner>>,
}

impl JobTicket {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Token fired when this job is evicted to make room.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_evicted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        let mut inner = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        // Already gone if the job was evicted.
        if let Some(idx) = inner.jobs.iter().position(|j| j.id == self.id) {
            inner.jobs.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_limit() {
        let queue = AdmissionQueue::new(2);
        let _a = queue.admit(JobKind::Human).unwrap();
        let _b = queue.admit(JobKind::Human).unwrap();
        assert_eq!(queue.depth(), 2);

        let err = queue.admit(JobKind::Human).unwrap_err();
        assert!(matches!(err, HubError::QueueFull { .. }));
    }

    #[test]
    fn dropping_ticket_releases_slot() {
        let queue = AdmissionQueue::new(1);
        let a = queue.admit(JobKind::Human).unwrap();
        assert!(queue.admit(JobKind::Human).is_err());

        drop(a);
        assert_eq!(queue.depth(), 0);
        assert!(queue.admit(JobKind::Human).is_ok());
    }

    #[test]
    fn human_evicts_agent_job_when_full() {
        let queue = AdmissionQueue::new(2);
        let agent = queue.admit(JobKind::Agent).unwrap();
        let _h1 = queue.admit(JobKind::Human).unwrap();

        // Full. A new human message must evict the agent job, not be
        // rejected.
        let h2 = queue.admit(JobKind::Human);
        assert!(h2.is_ok());
        assert!(agent.is_evicted());
        assert_eq!(queue.evictions(), 1);
    }

    #[test]
    fn system_evicted_before_agent() {
        let queue = AdmissionQueue::new(2);
        let agent = queue.admit(JobKind::Agent).unwrap();
        let system = queue.admit(JobKind::System).unwrap();

        let _h = queue.admit(JobKind::Human).unwrap();
        assert!(system.is_evicted(), "system dropped first of all");
        assert!(!agent.is_evicted());
    }

    #[test]
    fn oldest_agent_evicted_first() {
        let queue = AdmissionQueue::new(2);
        let old_agent = queue.admit(JobKind::Agent).unwrap();
        let new_agent = queue.admit(JobKind::Agent).unwrap();

        let _h = queue.admit(JobKind::Human).unwrap();
        assert!(old_agent.is_evicted());
        assert!(!new_agent.is_evicted());
    }

    #[test]
    fn human_rejected_only_when_no_lower_priority_remains() {
        let queue = AdmissionQueue::new(2);
        let _h1 = queue.admit(JobKind::Human).unwrap();
        let _h2 = queue.admit(JobKind::Human).unwrap();

        // Only human work in flight: nothing to evict.
        let err = queue.admit(JobKind::Human).unwrap_err();
        assert!(matches!(err, HubError::QueueFull { .. }));
        assert_eq!(queue.evictions(), 0);
    }

    #[test]
    fn agent_may_evict_system_but_not_agent() {
        let queue = AdmissionQueue::new(2);
        let system = queue.admit(JobKind::System).unwrap();
        let other_agent = queue.admit(JobKind::Agent).unwrap();

        let res = queue.admit(JobKind::Agent);
        assert!(res.is_ok());
        assert!(system.is_evicted());
        assert!(!other_agent.is_evicted());

        // Queue now holds two agent jobs; a third agent has nothing
        // below it to evict.
        assert!(queue.admit(JobKind::Agent).is_err());
    }

    #[test]
    fn system_never_evicts() {
        let queue = AdmissionQueue::new(1);
        let _s = queue.admit(JobKind::System).unwrap();
        assert!(queue.admit(JobKind::System).is_err());
    }

    #[test]
    fn spec_scenario_pending_agent_plus_two_humans() {
        // queue_limit=2; one pending agent job plus a pending human
        // saturate the queue; the next human triggers eviction of the
        // agent job, not rejection of the human message.
        let queue = AdmissionQueue::new(2);
        let agent = queue.admit(JobKind::Agent).unwrap();
        let _h1 = queue.admit(JobKind::Human).unwrap();
        let h2 = queue.admit(JobKind::Human);

        assert!(h2.is_ok());
        assert!(agent.is_evicted());
    }
}
