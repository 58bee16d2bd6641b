//! Worker Pool (C5, spec §4.5, §4.7): N concurrent workers draining the priority queue.
//!
//! Grounded on the teacher's `JobWorker<S: JobStore>` claim→dispatch→heartbeat→complete loop
//! (`kernel/jobs/worker.rs`), generalized from a Postgres-specific store to the crate's
//! [`PriorityQueue`]/[`Repository`]/[`Notifier`] traits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::analyser::Analyser;
use crate::domain::LinkState;
use crate::notifier::{Event, Notifier};
use crate::queue::{PriorityQueue, MAX_ATTEMPTS};
use crate::repository::Repository;

/// How long a lease is held before it's eligible for reclaim by another worker (spec §6:
/// `lease_timeout_ms = render_timeout * 1.5`, with the default 60s render timeout).
const LEASE_DURATION: Duration = Duration::from_secs(90);

pub struct WorkerPool {
    queue: Arc<dyn PriorityQueue>,
    repository: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    analyser: Arc<Analyser>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn PriorityQueue>,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        analyser: Arc<Analyser>,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            repository,
            notifier,
            analyser,
            concurrency,
        }
    }

    /// Runs forever, polling for leases and dispatching each to its own task. Each worker runs
    /// exactly one job at a time and releases its lease on every exit path (spec §5).
    pub async fn run(&self, poll_interval: Duration) -> ! {
        loop {
            match self.queue.lease(self.concurrency, LEASE_DURATION).await {
                Ok(leases) if leases.is_empty() => {
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(leases) => {
                    let mut handles = Vec::with_capacity(leases.len());
                    for lease in leases {
                        let queue = Arc::clone(&self.queue);
                        let repository = Arc::clone(&self.repository);
                        let notifier = Arc::clone(&self.notifier);
                        let analyser = Arc::clone(&self.analyser);
                        handles.push(tokio::spawn(async move {
                            process_one(queue, repository, notifier, analyser, lease).await;
                        }));
                    }
                    for handle in handles {
                        if let Err(e) = handle.await {
                            error!(error = %e, "worker task panicked");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "queue unavailable, backing off");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// One reclaim pass for leases past their expiry (spec §5 crash recovery). Call this on a
    /// timer independent of `run`'s own poll loop.
    pub async fn reclaim_expired_leases(&self) -> Result<usize, crate::error::BackendUnavailable> {
        self.queue.reclaim_expired().await
    }
}

async fn process_one(
    queue: Arc<dyn PriorityQueue>,
    repository: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    analyser: Arc<Analyser>,
    lease: crate::queue::Lease,
) {
    let job = lease.job;
    info!(job_id = %job.job_id, url = %job.source_url, "starting job");
    let _ = notifier
        .publish(job.project_id, Event::JobStarted { job_id: job.job_id })
        .await;

    let verdict = analyser.analyse(&job.source_url, &job.target_domain).await;

    if let Some(link_id) = job.link_id {
        match repository.get_link(link_id).await {
            Ok(Some(mut link)) => {
                verdict.apply_to(&mut link);
                if let Err(e) = repository.upsert_link(&link).await {
                    warn!(job_id = %job.job_id, error = %e, "failed to persist verdict");
                    let _ = queue.fail(lease.lease_id, &e.0).await;
                    return;
                }
            }
            Ok(None) => warn!(job_id = %job.job_id, link_id = %link_id, "link row missing at completion"),
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "repository unavailable at completion");
                let _ = queue.fail(lease.lease_id, &e.0).await;
                return;
            }
        }
    }

    let _ = notifier
        .publish(
            job.project_id,
            Event::JobSucceeded {
                job_id: job.job_id,
                verdict: verdict.clone(),
            },
        )
        .await;

    // Analyser success (`ok`) completes the lease outright. Analyser failure (`problem`) still
    // writes the verdict above for visibility, but the *job* goes through the queue's own
    // retry/backoff — a second attempt may land on a page that was only transiently broken
    // (spec §4.2: "on analyser failure ... calls Fail").
    match verdict.state {
        LinkState::Ok => {
            if let Err(e) = queue.complete(lease.lease_id).await {
                error!(job_id = %job.job_id, error = %e, "failed to release lease after completion");
            }
        }
        LinkState::Problem => {
            let reason = verdict.non_indexable_reason.as_deref().unwrap_or("problem");
            if let Err(e) = queue.fail(lease.lease_id, reason).await {
                error!(job_id = %job.job_id, error = %e, "failed to fail lease after problem verdict");
            }
            if job.attempts + 1 > MAX_ATTEMPTS {
                let _ = notifier
                    .publish(job.project_id, Event::JobDeadLettered { job_id: job.job_id })
                    .await;
            }
        }
        LinkState::Pending | LinkState::Running => unreachable!("analyser always resolves to a terminal state"),
    }

    // Sheet runs are watched to completion by the scheduler (which must order results by row
    // index before writing them back); only batch jobs emit the generic completion event here.
    if job.kind == crate::domain::LinkKind::Batch {
        // Spec §4.7: completion asks *both* the repository (every link row terminal) and the
        // queue (no job for this project+kind still waiting, leased, or mid-backoff). A
        // `problem` verdict writes a terminal link row above while simultaneously handing the
        // job back to the queue for retry via `Fail` — checking the repository alone would
        // fire completion early, then again once the retry lands, violating "exactly one of
        // {analysis_completed, analysis_error}".
        let repo_complete = matches!(
            repository.project_batch_is_complete(job.project_id, job.kind).await,
            Ok(true)
        );
        let queue_outstanding = queue
            .has_outstanding(job.project_id, job.kind)
            .await
            .unwrap_or(true);

        if repo_complete && !queue_outstanding {
            if let Ok(links) = repository.list_by_project_and_kind(job.project_id, job.kind).await {
                let _ = notifier
                    .publish(
                        job.project_id,
                        Event::BatchCompleted {
                            project_id: job.project_id,
                            link_count: links.len(),
                        },
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::AnalyserConfig;
    use crate::analyser::render::{RenderEngine, RenderedPage};
    use crate::domain::{Job, LinkKind, Priority};
    use crate::notifier::in_memory::InMemoryNotifier;
    use crate::queue::in_memory::InMemoryQueue;
    use crate::repository::in_memory::InMemoryRepository;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct AlwaysOk;

    #[async_trait]
    impl RenderEngine for AlwaysOk {
        async fn render(
            &self,
            _url: &str,
            _user_agent: &str,
            _timeout: Duration,
        ) -> Result<RenderedPage, crate::error::AnalyserError> {
            Ok(RenderedPage {
                primary_status: 200,
                final_url: "https://src.example.com/a".to_string(),
                x_robots_tag: None,
                html: r#"<a href="https://target.com/x">x</a>"#.to_string(),
                load_time_ms: 5,
            })
        }
    }

    #[tokio::test]
    async fn processing_a_job_persists_the_verdict_and_completes_the_lease() {
        let queue: Arc<dyn PriorityQueue> = Arc::new(InMemoryQueue::new());
        let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let notifier: Arc<dyn Notifier> = Arc::new(InMemoryNotifier::new());
        let analyser = Arc::new(Analyser::new(Arc::new(AlwaysOk), None, AnalyserConfig::default()));

        let project_id = Uuid::new_v4();
        let link = crate::domain::Link::new_pending(
            project_id,
            "https://src.example.com/a".to_string(),
            "target.com".to_string(),
            "target.com".to_string(),
            LinkKind::Batch,
        );
        repository.upsert_link(&link).await.unwrap();

        let job = Job::new(
            LinkKind::Batch,
            Uuid::new_v4(),
            project_id,
            Some(link.id),
            None,
            link.source_url.clone(),
            link.target_domain.clone(),
            Priority::FREE,
        );
        queue.enqueue(job).await.unwrap();

        let leases = queue.lease(1, Duration::from_secs(30)).await.unwrap();
        process_one(
            Arc::clone(&queue),
            Arc::clone(&repository),
            Arc::clone(&notifier),
            Arc::clone(&analyser),
            leases.into_iter().next().unwrap(),
        )
        .await;

        let reloaded = repository.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, LinkState::Ok);

        let remaining = queue.lease(1, Duration::from_secs(30)).await.unwrap();
        assert!(remaining.is_empty());
    }

    struct AlwaysAbsent;

    #[async_trait]
    impl RenderEngine for AlwaysAbsent {
        async fn render(
            &self,
            _url: &str,
            _user_agent: &str,
            _timeout: Duration,
        ) -> Result<RenderedPage, crate::error::AnalyserError> {
            Ok(RenderedPage {
                primary_status: 200,
                final_url: "https://src.example.com/a".to_string(),
                x_robots_tag: None,
                html: "<html><body>no links here</body></html>".to_string(),
                load_time_ms: 5,
            })
        }
    }

    #[tokio::test]
    async fn a_problem_verdict_queued_for_retry_does_not_fire_completion_early() {
        // Spec §4.7: completion requires the repository *and* the queue to agree nothing is
        // outstanding. A `problem` verdict writes a terminal link row while the job itself goes
        // back to the queue for retry/backoff — that in-flight retry must suppress
        // `BatchCompleted` even though every link row looks terminal.
        let queue: Arc<dyn PriorityQueue> = Arc::new(InMemoryQueue::new());
        let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let analyser = Arc::new(Analyser::new(Arc::new(AlwaysAbsent), None, AnalyserConfig::default()));

        let project_id = Uuid::new_v4();
        let link = crate::domain::Link::new_pending(
            project_id,
            "https://src.example.com/a".to_string(),
            "target.com".to_string(),
            "target.com".to_string(),
            LinkKind::Batch,
        );
        repository.upsert_link(&link).await.unwrap();

        let job = Job::new(
            LinkKind::Batch,
            Uuid::new_v4(),
            project_id,
            Some(link.id),
            None,
            link.source_url.clone(),
            link.target_domain.clone(),
            Priority::FREE,
        );
        queue.enqueue(job).await.unwrap();

        let mut rx = notifier.subscribe(project_id);
        let leases = queue.lease(1, Duration::from_secs(30)).await.unwrap();
        process_one(
            Arc::clone(&queue),
            Arc::clone(&repository),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&analyser),
            leases.into_iter().next().unwrap(),
        )
        .await;

        let reloaded = repository.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, LinkState::Problem);
        assert!(queue.has_outstanding(project_id, LinkKind::Batch).await.unwrap());

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::BatchCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(!saw_completed);
    }
}
