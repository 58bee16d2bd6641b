//! Notifier (C2, spec §4.2): a closed set of events pushed to subscribers as work progresses.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Job, Verdict};
use crate::error::BackendUnavailable;

/// Every event the pipeline can emit. Closed on purpose — callers match exhaustively rather
/// than stringly-typed topics (spec §4.2).
#[derive(Debug, Clone)]
pub enum Event {
    JobQueued { job_id: Uuid, project_id: Uuid },
    /// One run-level start for an entire batch (spec §5: "`analysis_started` precedes any
    /// `link_updated`"; §8: "exactly one `analysis_started`" per project per run). Emitted once
    /// by the batch producer, never per job.
    BatchRunStarted { project_id: Uuid },
    /// Per-job progress within a run. Distinct from [`Event::BatchRunStarted`] — many of these
    /// fire per run, wired to the closed `analysis_progress` event kind (spec §4.2).
    JobStarted { job_id: Uuid },
    JobSucceeded { job_id: Uuid, verdict: Verdict },
    JobFailed { job_id: Uuid, reason: String },
    JobDeadLettered { job_id: Uuid },
    BatchCompleted { project_id: Uuid, link_count: usize },
    SheetRunStarted { sheet_id: Uuid },
    SheetRunCompleted { sheet_id: Uuid, link_count: usize },
    SheetRunFailed { sheet_id: Uuid, reason: String },
}

/// Capability: publish pipeline events to whatever transport a deployment wires up (broadcast
/// channel, websocket hub, message bus). Grounded on the teacher's topic-keyed broadcast hub;
/// generalized here to a closed domain event rather than an arbitrary payload.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, project_id: Uuid, event: Event) -> Result<(), BackendUnavailable>;
}

pub fn job_queued(job: &Job) -> Event {
    Event::JobQueued {
        job_id: job.job_id,
        project_id: job.project_id,
    }
}

/// Reference/test implementation: a per-project broadcast channel, mirroring the teacher's
/// `StreamHub` topic-keyed fan-out but scoped to the closed [`Event`] type.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    const CHANNEL_CAPACITY: usize = 256;

    pub struct InMemoryNotifier {
        topics: Mutex<HashMap<Uuid, broadcast::Sender<Event>>>,
    }

    impl InMemoryNotifier {
        pub fn new() -> Self {
            Self {
                topics: Mutex::new(HashMap::new()),
            }
        }

        pub fn subscribe(&self, project_id: Uuid) -> broadcast::Receiver<Event> {
            let mut topics = self.topics.lock().unwrap();
            topics
                .entry(project_id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        }
    }

    impl Default for InMemoryNotifier {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Notifier for InMemoryNotifier {
        async fn publish(&self, project_id: Uuid, event: Event) -> Result<(), BackendUnavailable> {
            let mut topics = self.topics.lock().unwrap();
            let sender = topics
                .entry(project_id)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
            // No subscribers yet is not an error: events are fire-and-forget broadcasts.
            let _ = sender.send(event);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryNotifier;
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let notifier = InMemoryNotifier::new();
        let project_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(project_id);

        notifier
            .publish(project_id, Event::SheetRunStarted { sheet_id: Uuid::new_v4() })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::SheetRunStarted { .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let notifier = InMemoryNotifier::new();
        let result = notifier
            .publish(Uuid::new_v4(), Event::JobDeadLettered { job_id: Uuid::new_v4() })
            .await;
        assert!(result.is_ok());
    }
}
