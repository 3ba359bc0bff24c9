//! In-process event bus
//!
//! Every published status is delivered to every subscriber whose filter
//! matches, in publication order. Publishers never block: a subscriber
//! whose inbox is full is dropped and its stream closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use kiln_domain::{filter, FilterExpression, FilterOp, FilterTerm, JobStatus};

/// Per-subscriber inbox capacity. Small on purpose: a subscriber that
/// cannot keep up with this much slack is beyond saving.
const SUBSCRIBER_INBOX: usize = 32;

struct Subscriber {
    filter: Vec<FilterExpression>,
    tx: mpsc::Sender<JobStatus>,
}

/// Single-process publish/subscribe over job statuses.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes with a filter; an empty filter matches everything.
    pub fn subscribe(&self, filter: Vec<FilterExpression>) -> mpsc::Receiver<JobStatus> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_INBOX);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscriber { filter, tx });
        rx
    }

    /// Subscribes to a single job by name.
    pub fn subscribe_job(&self, name: &str) -> mpsc::Receiver<JobStatus> {
        self.subscribe(vec![FilterExpression {
            terms: vec![FilterTerm {
                field: "name".to_string(),
                value: name.to_string(),
                operation: FilterOp::Equals,
                negate: false,
            }],
        }])
    }

    /// Delivers a status to all matching subscribers. Never blocks.
    pub fn publish(&self, status: &JobStatus) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|sub| {
            if !filter::matches(&sub.filter, status) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(status.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(job = %status.name, "dropping slow event subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of subscribers dropped for not keeping up.
    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_domain::{JobConditions, JobPhase};
    use pretty_assertions::assert_eq;

    fn status(name: &str, phase: JobPhase) -> JobStatus {
        JobStatus {
            name: name.to_string(),
            phase,
            conditions: JobConditions {
                success: phase == JobPhase::Done,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn prefix_filter(prefix: &str) -> Vec<FilterExpression> {
        vec![FilterExpression {
            terms: vec![FilterTerm {
                field: "name".to_string(),
                value: prefix.to_string(),
                operation: FilterOp::StartsWith,
                negate: false,
            }],
        }]
    }

    #[tokio::test]
    async fn subscribers_only_see_matching_jobs() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(prefix_filter("alpha"));

        for name in ["alpha-1", "alpha-2", "beta-1"] {
            bus.publish(&status(name, JobPhase::Running));
            bus.publish(&status(name, JobPhase::Done));
        }

        let mut seen = Vec::new();
        while let Ok(s) = rx.try_recv() {
            seen.push((s.name, s.phase));
        }
        assert_eq!(
            seen,
            vec![
                ("alpha-1".to_string(), JobPhase::Running),
                ("alpha-1".to_string(), JobPhase::Done),
                ("alpha-2".to_string(), JobPhase::Running),
                ("alpha-2".to_string(), JobPhase::Done),
            ]
        );
    }

    #[tokio::test]
    async fn updates_arrive_in_publication_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Vec::new());

        bus.publish(&status("a", JobPhase::Preparing));
        bus.publish(&status("a", JobPhase::Running));
        bus.publish(&status("a", JobPhase::Done));

        assert_eq!(rx.recv().await.unwrap().phase, JobPhase::Preparing);
        assert_eq!(rx.recv().await.unwrap().phase, JobPhase::Running);
        assert_eq!(rx.recv().await.unwrap().phase, JobPhase::Done);
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_not_waited_for() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Vec::new());

        for i in 0..(SUBSCRIBER_INBOX + 1) {
            bus.publish(&status(&format!("job-{i}"), JobPhase::Running));
        }
        assert_eq!(bus.dropped_subscribers(), 1);

        // the backlog is still readable, then the stream closes
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, SUBSCRIBER_INBOX);
    }

    #[tokio::test]
    async fn closed_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(Vec::new());
        drop(rx);
        bus.publish(&status("a", JobPhase::Running));
        assert_eq!(bus.dropped_subscribers(), 0);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}
