//! Ad-hoc batch ingress (spec §1, §2): accepts `(source_url, target_domain)` pairs for a
//! project and turns each into a pending `Link` + queued `Job`.
//!
//! Request routing, auth, and plan-based quota enforcement around this endpoint are external
//! collaborators the core doesn't implement (spec §1 "out of scope"); this handler is the
//! minimal producer the spec describes — "Batch requests ... call `Queue.Enqueue`" — with
//! nothing else layered on.

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use link_analyser::domain::{Link, LinkKind};
use link_analyser::{Event, Job};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::app::AxumAppState;

#[derive(Debug, Deserialize)]
pub struct BatchRequestItem {
    pub source_url: String,
    pub target_domain: String,
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct BatchResultItem {
    pub source_url: String,
    pub link_id: Option<Uuid>,
    pub error: Option<String>,
}

/// `POST /api/projects/:project_id/batch`
///
/// Each item is validated and enqueued independently: a malformed URL or target domain fails
/// just that item (spec §7 `malformed_input` — "rejected at enqueue, never enqueued") without
/// aborting the rest of the batch.
pub async fn enqueue_batch(
    Extension(state): Extension<AxumAppState>,
    Path(project_id): Path<Uuid>,
    Json(items): Json<Vec<BatchRequestItem>>,
) -> Result<(StatusCode, Json<Vec<BatchResultItem>>), StatusCode> {
    // One run-level start for the whole batch (spec §8: "exactly one `analysis_started`" per
    // project per run) — never one per item, which is what publishing inside `enqueue_one`
    // would produce.
    let _ = state
        .notifier
        .publish(project_id, Event::BatchRunStarted { project_id })
        .await;

    let mut results = Vec::with_capacity(items.len());

    for item in items {
        results.push(enqueue_one(&state, project_id, item).await);
    }

    Ok((StatusCode::ACCEPTED, Json(results)))
}

async fn enqueue_one(
    state: &AxumAppState,
    project_id: Uuid,
    item: BatchRequestItem,
) -> BatchResultItem {
    let source_url = item.source_url.clone();

    let parsed = match url::Url::parse(&item.source_url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
        _ => {
            return BatchResultItem {
                source_url,
                link_id: None,
                error: Some("invalid source_url".to_string()),
            }
        }
    };
    let _ = parsed; // validated only; the analyser re-resolves it during the render pass.

    let target_domain = match link_analyser::normalise::normalise_domain(&item.target_domain) {
        Ok(d) => d,
        Err(e) => {
            return BatchResultItem {
                source_url,
                link_id: None,
                error: Some(e.to_string()),
            }
        }
    };

    let priority = match state.repository.get_user_priority(item.user_id).await {
        Ok(p) => p,
        Err(e) => {
            return BatchResultItem {
                source_url,
                link_id: None,
                error: Some(e.to_string()),
            }
        }
    };

    let link = Link::new_pending(
        project_id,
        source_url.clone(),
        target_domain.clone(),
        item.target_domain.clone(),
        LinkKind::Batch,
    );
    if let Err(e) = state.repository.upsert_link(&link).await {
        return BatchResultItem {
            source_url,
            link_id: None,
            error: Some(e.to_string()),
        };
    }

    let job = Job::new(
        LinkKind::Batch,
        item.user_id,
        project_id,
        Some(link.id),
        None,
        source_url.clone(),
        target_domain,
        priority,
    );
    if let Err(e) = state.queue.enqueue(job).await {
        return BatchResultItem {
            source_url,
            link_id: Some(link.id),
            error: Some(e.to_string()),
        };
    }

    BatchResultItem {
        source_url,
        link_id: Some(link.id),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_analyser::queue::in_memory::InMemoryQueue;
    use link_analyser::repository::in_memory::InMemoryRepository;
    use link_analyser::Priority;
    use std::sync::Arc;

    fn test_state() -> AxumAppState {
        AxumAppState {
            db_pool: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool never dials out"),
            stream_hub: crate::kernel::StreamHub::new(),
            repository: Arc::new(InMemoryRepository::new()),
            queue: Arc::new(InMemoryQueue::new()),
            notifier: Arc::new(link_analyser::notifier::in_memory::InMemoryNotifier::new()),
        }
    }

    #[tokio::test]
    async fn valid_item_enqueues_a_pending_link_and_a_job() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let item = BatchRequestItem {
            source_url: "https://src.example.com/a".to_string(),
            target_domain: "Target.com".to_string(),
            user_id: Uuid::new_v4(),
        };

        let result = enqueue_one(&state, project_id, item).await;

        assert!(result.error.is_none());
        let link_id = result.link_id.expect("link created");
        let link = state.repository.get_link(link_id).await.unwrap().unwrap();
        assert_eq!(link.target_domain, "target.com");
        assert_eq!(link.state, link_analyser::LinkState::Pending);
    }

    #[tokio::test]
    async fn malformed_source_url_is_rejected_without_touching_storage() {
        let state = test_state();
        let item = BatchRequestItem {
            source_url: "not a url".to_string(),
            target_domain: "target.com".to_string(),
            user_id: Uuid::new_v4(),
        };

        let result = enqueue_one(&state, Uuid::new_v4(), item).await;

        assert!(result.error.is_some());
        assert!(result.link_id.is_none());
    }

    #[tokio::test]
    async fn enterprise_user_priority_is_looked_up_before_enqueueing() {
        let repo = InMemoryRepository::new();
        let user_id = Uuid::new_v4();
        repo.set_user_priority(user_id, Priority::ENTERPRISE);
        let state = AxumAppState {
            db_pool: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool never dials out"),
            stream_hub: crate::kernel::StreamHub::new(),
            repository: Arc::new(repo),
            queue: Arc::new(InMemoryQueue::new()),
            notifier: Arc::new(link_analyser::notifier::in_memory::InMemoryNotifier::new()),
        };
        let project_id = Uuid::new_v4();
        let item = BatchRequestItem {
            source_url: "https://src.example.com/b".to_string(),
            target_domain: "target.com".to_string(),
            user_id,
        };

        let result = enqueue_one(&state, project_id, item).await;
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn batch_handler_processes_every_item_independently() {
        let state = test_state();
        let project_id = Uuid::new_v4();
        let items = vec![
            BatchRequestItem {
                source_url: "https://src.example.com/ok".to_string(),
                target_domain: "target.com".to_string(),
                user_id: Uuid::new_v4(),
            },
            BatchRequestItem {
                source_url: "ftp://bad.example.com".to_string(),
                target_domain: "target.com".to_string(),
                user_id: Uuid::new_v4(),
            },
        ];

        let (status, Json(results)) = enqueue_batch(
            Extension(state),
            Path(project_id),
            Json(items),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(results.len(), 2);
        assert!(results[0].error.is_none());
        assert!(results[1].error.is_some());
    }

    #[tokio::test]
    async fn batch_handler_emits_exactly_one_run_started_event_regardless_of_item_count() {
        let notifier = Arc::new(link_analyser::notifier::in_memory::InMemoryNotifier::new());
        let project_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(project_id);
        let state = AxumAppState {
            db_pool: sqlx::postgres::PgPoolOptions::new()
                .connect_lazy("postgres://localhost/unused")
                .expect("lazy pool never dials out"),
            stream_hub: crate::kernel::StreamHub::new(),
            repository: Arc::new(InMemoryRepository::new()),
            queue: Arc::new(InMemoryQueue::new()),
            notifier,
        };
        let items = vec![
            BatchRequestItem {
                source_url: "https://src.example.com/a".to_string(),
                target_domain: "target.com".to_string(),
                user_id: Uuid::new_v4(),
            },
            BatchRequestItem {
                source_url: "https://src.example.com/b".to_string(),
                target_domain: "target.com".to_string(),
                user_id: Uuid::new_v4(),
            },
        ];

        enqueue_batch(Extension(state), Path(project_id), Json(items))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, link_analyser::Event::BatchRunStarted { .. }));
        // Draining further would only find per-job `JobStarted`/`JobSucceeded` events, never a
        // second `BatchRunStarted` — exactly one per run (spec §8).
        let mut saw_second_start = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, link_analyser::Event::BatchRunStarted { .. }) {
                saw_second_start = true;
            }
        }
        assert!(!saw_second_start);
    }
}
