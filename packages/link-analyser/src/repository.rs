//! Repository (C1, spec §4.1): durable storage for links, sheets and scheduled tasks.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Link, LinkKind, Priority, Sheet};
use crate::error::BackendUnavailable;

/// Capability: the durable store behind every other component. Storage-agnostic by design —
/// a binary wires in a Postgres-backed implementation; tests use an in-memory one.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_link(&self, link: &Link) -> Result<(), BackendUnavailable>;
    async fn get_link(&self, id: Uuid) -> Result<Option<Link>, BackendUnavailable>;
    async fn links_for_project(&self, project_id: Uuid) -> Result<Vec<Link>, BackendUnavailable>;

    /// `ListByProjectAndKind` (spec §4.6): the subset of `links_for_project` scoped to one
    /// producer. Used to watch one run (batch or sheet) to completion without picking up rows
    /// belonging to the other producer sharing the project.
    async fn list_by_project_and_kind(
        &self,
        project_id: Uuid,
        kind: LinkKind,
    ) -> Result<Vec<Link>, BackendUnavailable>;

    /// Clears every verdict field on every link in `project_id`/`kind` back to `pending`, ahead
    /// of a new run (spec §5 happens-before barrier; see [`Link::reset`]).
    async fn reset_analysis(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable>;

    /// Deletes every `kind`-tagged link row for `project_id`. Sheets are authoritative per run
    /// (spec §4.6 step 3): unlike `reset_analysis`, which re-runs the same rows in place, a
    /// sheet run replaces its rows outright since the sheet's row count/order may have changed.
    async fn delete_links_by_kind(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable>;

    async fn upsert_sheet(&self, sheet: &Sheet) -> Result<(), BackendUnavailable>;
    async fn get_sheet(&self, id: Uuid) -> Result<Option<Sheet>, BackendUnavailable>;
    async fn active_sheets(&self) -> Result<Vec<Sheet>, BackendUnavailable>;

    /// `GetUserPriority` (spec §4.6): a user's queue priority, derived from their plan tier.
    async fn get_user_priority(&self, user_id: Uuid) -> Result<Priority, BackendUnavailable>;

    /// `true` once every link belonging to `project_id`/`kind` has reached a terminal state
    /// (spec §4.7, batch-completion check). This is the repository-side half only: a caller
    /// must also confirm the queue has no outstanding job for the same project+kind
    /// ([`crate::queue::PriorityQueue::has_outstanding`]) before treating the run as complete.
    async fn project_batch_is_complete(
        &self,
        project_id: Uuid,
        kind: LinkKind,
    ) -> Result<bool, BackendUnavailable>;
}

/// Reference/test implementation backing the worker and scheduler unit tests.
pub mod in_memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRepository {
        links: Mutex<HashMap<Uuid, Link>>,
        sheets: Mutex<HashMap<Uuid, Sheet>>,
        user_priorities: Mutex<HashMap<Uuid, Priority>>,
    }

    impl InMemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Test/seed helper: records the plan-derived priority a `get_user_priority` call
        /// should return for `user_id`. Unregistered users default to [`Priority::FREE`].
        pub fn set_user_priority(&self, user_id: Uuid, priority: Priority) {
            self.user_priorities.lock().unwrap().insert(user_id, priority);
        }
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn upsert_link(&self, link: &Link) -> Result<(), BackendUnavailable> {
            self.links.lock().unwrap().insert(link.id, link.clone());
            Ok(())
        }

        async fn get_link(&self, id: Uuid) -> Result<Option<Link>, BackendUnavailable> {
            Ok(self.links.lock().unwrap().get(&id).cloned())
        }

        async fn links_for_project(&self, project_id: Uuid) -> Result<Vec<Link>, BackendUnavailable> {
            Ok(self
                .links
                .lock()
                .unwrap()
                .values()
                .filter(|l| l.project_id == project_id)
                .cloned()
                .collect())
        }

        async fn list_by_project_and_kind(
            &self,
            project_id: Uuid,
            kind: LinkKind,
        ) -> Result<Vec<Link>, BackendUnavailable> {
            Ok(self
                .links
                .lock()
                .unwrap()
                .values()
                .filter(|l| l.project_id == project_id && l.kind == kind)
                .cloned()
                .collect())
        }

        async fn reset_analysis(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable> {
            let mut links = self.links.lock().unwrap();
            let mut count = 0;
            for link in links
                .values_mut()
                .filter(|l| l.project_id == project_id && l.kind == kind)
            {
                link.reset();
                count += 1;
            }
            Ok(count)
        }

        async fn delete_links_by_kind(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable> {
            let mut links = self.links.lock().unwrap();
            let before = links.len();
            links.retain(|_, l| !(l.project_id == project_id && l.kind == kind));
            Ok(before - links.len())
        }

        async fn get_user_priority(&self, user_id: Uuid) -> Result<Priority, BackendUnavailable> {
            Ok(self
                .user_priorities
                .lock()
                .unwrap()
                .get(&user_id)
                .copied()
                .unwrap_or(Priority::FREE))
        }

        async fn upsert_sheet(&self, sheet: &Sheet) -> Result<(), BackendUnavailable> {
            self.sheets.lock().unwrap().insert(sheet.id, sheet.clone());
            Ok(())
        }

        async fn get_sheet(&self, id: Uuid) -> Result<Option<Sheet>, BackendUnavailable> {
            Ok(self.sheets.lock().unwrap().get(&id).cloned())
        }

        async fn active_sheets(&self) -> Result<Vec<Sheet>, BackendUnavailable> {
            use crate::domain::{Interval, SheetStatus};
            Ok(self
                .sheets
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.interval != Interval::Manual && s.status != SheetStatus::Inactive)
                .cloned()
                .collect())
        }

        async fn project_batch_is_complete(
            &self,
            project_id: Uuid,
            kind: LinkKind,
        ) -> Result<bool, BackendUnavailable> {
            use crate::domain::LinkState;
            let links = self.links.lock().unwrap();
            let mut saw_any = false;
            for link in links
                .values()
                .filter(|l| l.project_id == project_id && l.kind == kind)
            {
                saw_any = true;
                if !matches!(link.state, LinkState::Ok | LinkState::Problem) {
                    return Ok(false);
                }
            }
            Ok(saw_any)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::InMemoryRepository;
    use super::*;
    use crate::domain::{LinkKind, LinkState};

    fn pending_link(project_id: Uuid) -> Link {
        Link::new_pending(
            project_id,
            "https://src.example.com/a".to_string(),
            "target.com".to_string(),
            "target.com".to_string(),
            LinkKind::Batch,
        )
    }

    #[tokio::test]
    async fn batch_not_complete_until_every_link_is_terminal() {
        let repo = InMemoryRepository::new();
        let project_id = Uuid::new_v4();
        let mut link = pending_link(project_id);
        repo.upsert_link(&link).await.unwrap();

        assert!(!repo.project_batch_is_complete(project_id, LinkKind::Batch).await.unwrap());

        link.state = LinkState::Ok;
        repo.upsert_link(&link).await.unwrap();
        assert!(repo.project_batch_is_complete(project_id, LinkKind::Batch).await.unwrap());
    }

    #[tokio::test]
    async fn active_sheets_excludes_cancelled_and_manual_sheets() {
        use crate::domain::{Interval, SheetStatus};

        let repo = InMemoryRepository::new();
        let project_id = Uuid::new_v4();

        let mut cancelled = sample_sheet(project_id, Interval::OneDay);
        cancelled.status = SheetStatus::Inactive;
        let manual = sample_sheet(project_id, Interval::Manual);
        let mut running = sample_sheet(project_id, Interval::OneDay);
        running.id = Uuid::new_v4();

        repo.upsert_sheet(&cancelled).await.unwrap();
        repo.upsert_sheet(&manual).await.unwrap();
        repo.upsert_sheet(&running).await.unwrap();

        let active = repo.active_sheets().await.unwrap();
        let ids: Vec<Uuid> = active.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![running.id]);
    }

    fn sample_sheet(project_id: Uuid, interval: crate::domain::Interval) -> crate::domain::Sheet {
        use crate::domain::{Sheet, SheetStatus};
        Sheet {
            id: Uuid::new_v4(),
            project_id,
            user_id: Uuid::new_v4(),
            spreadsheet_ref: "1AbCdEf".to_string(),
            target_domain: "target.com".to_string(),
            url_column: "A".to_string(),
            target_column: "B".to_string(),
            result_range: vec!["F", "G", "H", "I", "J"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            interval,
            status: SheetStatus::NotStarted,
            last_run: None,
            next_run: None,
            run_count: 0,
        }
    }

    #[tokio::test]
    async fn reset_analysis_clears_verdict_fields() {
        let repo = InMemoryRepository::new();
        let project_id = Uuid::new_v4();
        let mut link = pending_link(project_id);
        link.state = LinkState::Ok;
        link.response_code = Some(200);
        repo.upsert_link(&link).await.unwrap();

        let reset_count = repo.reset_analysis(project_id, LinkKind::Batch).await.unwrap();
        assert_eq!(reset_count, 1);

        let reloaded = repo.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, LinkState::Pending);
        assert!(reloaded.response_code.is_none());
    }
}
