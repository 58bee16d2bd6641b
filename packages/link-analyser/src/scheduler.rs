//! Recurring Scheduler (C6, spec §4.6): per-sheet timers, manual through one-month intervals.
//!
//! Grounded on the teacher's `tokio_cron_scheduler`-backed `scheduled_tasks.rs`: that module
//! arms a fixed set of cron jobs at startup, while this one arms and re-arms one dynamic timer
//! per `Sheet`, recomputing `next_fire_at` from [`Interval::advance`] after every run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{Interval, Job, Link, LinkKind, ScheduledTask, Sheet, SheetStatus};
use crate::notifier::{Event, Notifier};
use crate::queue::PriorityQueue;
use crate::repository::Repository;
use crate::sheet_adapter::SheetAdapter;

/// How often the scheduler's driver loop wakes to check for due tasks. Fine-grained relative to
/// the shortest interval (`FiveMinutes`) so a due task fires within a few seconds of its target.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// How often the write-back watcher polls for every row of a run to reach a terminal state.
const WRITEBACK_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct Scheduler {
    repository: Arc<dyn Repository>,
    queue: Arc<dyn PriorityQueue>,
    notifier: Arc<dyn Notifier>,
    sheet_adapter: Arc<dyn SheetAdapter>,
    tasks: Arc<Mutex<HashMap<Uuid, ScheduledTask>>>,
}

impl Scheduler {
    pub fn new(
        repository: Arc<dyn Repository>,
        queue: Arc<dyn PriorityQueue>,
        notifier: Arc<dyn Notifier>,
        sheet_adapter: Arc<dyn SheetAdapter>,
    ) -> Self {
        Self {
            repository,
            queue,
            notifier,
            sheet_adapter,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arms (or re-arms) a timer for `sheet`. `Interval::Manual` never arms one — any existing
    /// task for the sheet is removed instead (spec §4.6).
    pub async fn arm(&self, sheet: &Sheet) {
        let mut tasks = self.tasks.lock().await;
        let Some(next_fire_at) = sheet.interval.advance(Utc::now()) else {
            tasks.remove(&sheet.id);
            return;
        };
        tasks.insert(
            sheet.id,
            ScheduledTask {
                sheet_id: sheet.id,
                interval: sheet.interval,
                next_fire_at,
                timer_handle: None,
                last_fire_at: None,
                fire_count: 0,
            },
        );
    }

    pub async fn disarm(&self, sheet_id: Uuid) {
        self.tasks.lock().await.remove(&sheet_id);
    }

    /// Spawns the driver loop as a background task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(TICK_INTERVAL).await;
            }
        })
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due_sheet_ids: Vec<Uuid> = {
            let tasks = self.tasks.lock().await;
            tasks
                .values()
                .filter(|t| t.next_fire_at <= now)
                .map(|t| t.sheet_id)
                .collect()
        };

        for sheet_id in due_sheet_ids {
            if let Err(e) = self.fire(sheet_id).await {
                warn!(sheet_id = %sheet_id, error = %e, "sheet run failed to start");
            }
        }
    }

    /// Steps 1-3 of spec §4.6: mark `analysing`, wipe the prior run's sheet-kind rows (the
    /// sheet is authoritative per run), read the sheet and enqueue one job per row against a
    /// freshly created `Link`. Step 4 (ordered write-back) and step 5 (rearm) happen in a
    /// detached watcher once every job this run enqueued reaches a terminal state — `fire`
    /// itself returns as soon as the run is under way, so one slow sheet can't block others
    /// sharing the driver loop's tick.
    async fn fire(&self, sheet_id: Uuid) -> Result<(), crate::error::BackendUnavailable> {
        let Some(mut sheet) = self.repository.get_sheet(sheet_id).await? else {
            self.disarm(sheet_id).await;
            return Ok(());
        };

        info!(sheet_id = %sheet_id, "sheet run starting");
        sheet.status = SheetStatus::Analysing;
        self.repository.upsert_sheet(&sheet).await?;
        let _ = self
            .notifier
            .publish(sheet.project_id, Event::SheetRunStarted { sheet_id })
            .await;

        let rows = match self.sheet_adapter.read_rows(&sheet).await {
            Ok(rows) => rows,
            Err(e) => {
                self.mark_errored(&mut sheet, &e.0).await;
                return Err(e);
            }
        };

        self.repository
            .delete_links_by_kind(sheet.project_id, LinkKind::Sheet)
            .await?;

        let priority = match self.repository.get_user_priority(sheet.user_id).await {
            Ok(p) => p,
            Err(e) => {
                self.mark_errored(&mut sheet, &e.0).await;
                return Err(e);
            }
        };

        let mut link_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            // `row.target_domain` already carries the sheet's default for a blank cell (spec
            // §4.5); a row that names its own target is not silently overridden with the
            // sheet-wide default.
            let normalised_target = crate::normalise::normalise_domain(&row.target_domain)
                .unwrap_or_else(|_| row.target_domain.to_lowercase());

            let link = Link::new_pending(
                sheet.project_id,
                row.source_url.clone(),
                normalised_target.clone(),
                row.target_domain.clone(),
                LinkKind::Sheet,
            );
            self.repository.upsert_link(&link).await?;
            link_ids.push(link.id);

            let job = Job::new(
                LinkKind::Sheet,
                sheet.user_id,
                sheet.project_id,
                Some(link.id),
                Some(sheet.id),
                row.source_url.clone(),
                normalised_target,
                priority,
            );
            self.queue.enqueue(job).await?;
        }

        if rows.is_empty() {
            // Nothing to wait for; finish the run synchronously.
            self.complete_run(&mut sheet, Vec::new()).await;
        } else {
            let scheduler = WritebackHandles {
                repository: Arc::clone(&self.repository),
                notifier: Arc::clone(&self.notifier),
                sheet_adapter: Arc::clone(&self.sheet_adapter),
                tasks: Arc::clone(&self.tasks),
            };
            tokio::spawn(watch_and_write_back(scheduler, sheet, link_ids));
        }

        Ok(())
    }

    async fn mark_errored(&self, sheet: &mut Sheet, reason: &str) {
        sheet.status = SheetStatus::Error;
        let _ = self.repository.upsert_sheet(sheet).await;
        let _ = self
            .notifier
            .publish(
                sheet.project_id,
                Event::SheetRunFailed {
                    sheet_id: sheet.id,
                    reason: reason.to_string(),
                },
            )
            .await;
        self.disarm(sheet.id).await;
    }

    /// Step 5 for the degenerate empty-sheet case: nothing to aggregate, so finish the run
    /// immediately instead of spawning a watcher with nothing to watch.
    async fn complete_run(&self, sheet: &mut Sheet, ordered_links: Vec<Link>) {
        finish_run(
            &self.repository,
            &self.notifier,
            &self.sheet_adapter,
            &self.tasks,
            sheet,
            ordered_links,
        )
        .await;
    }
}

/// Owned handles a detached write-back watcher needs; split out from `Scheduler` so the
/// watcher can outlive the `fire` call that spawned it without borrowing `&Scheduler`.
struct WritebackHandles {
    repository: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    sheet_adapter: Arc<dyn SheetAdapter>,
    tasks: Arc<Mutex<HashMap<Uuid, ScheduledTask>>>,
}

/// Polls until every link in `link_ids` (in row order) has reached a terminal state, then
/// performs spec §4.6 steps 4-5: ordered write-back, formatting, and rearming.
async fn watch_and_write_back(handles: WritebackHandles, mut sheet: Sheet, link_ids: Vec<Uuid>) {
    loop {
        let mut links = Vec::with_capacity(link_ids.len());
        let mut all_terminal = true;
        for id in &link_ids {
            match handles.repository.get_link(*id).await {
                Ok(Some(link)) => {
                    if !link.state.is_terminal() {
                        all_terminal = false;
                    }
                    links.push(link);
                }
                Ok(None) => all_terminal = false,
                Err(e) => {
                    warn!(sheet_id = %sheet.id, error = %e, "repository unavailable while watching sheet run");
                    tokio::time::sleep(WRITEBACK_POLL_INTERVAL).await;
                    continue;
                }
            }
        }

        if all_terminal {
            finish_run(
                &handles.repository,
                &handles.notifier,
                &handles.sheet_adapter,
                &handles.tasks,
                &mut sheet,
                links,
            )
            .await;
            return;
        }

        tokio::time::sleep(WRITEBACK_POLL_INTERVAL).await;
    }
}

/// Writes every row's verdict back in order, formats the range (best-effort), and transitions
/// the sheet to `checked`/rearms — or `error` with no rearm if the write-back itself fails.
async fn finish_run(
    repository: &Arc<dyn Repository>,
    notifier: &Arc<dyn Notifier>,
    sheet_adapter: &Arc<dyn SheetAdapter>,
    tasks: &Arc<Mutex<HashMap<Uuid, ScheduledTask>>>,
    sheet: &mut Sheet,
    ordered_links: Vec<Link>,
) {
    let mut write_failed = None;
    for (i, link) in ordered_links.iter().enumerate() {
        // Header row occupies row 1; data starts at row 2 (spec §4.5: "header row is skipped").
        let row_index = i + 2;
        if let Err(e) = sheet_adapter.write_result(sheet, row_index, link).await {
            write_failed = Some(e.0);
            break;
        }
    }

    if let Err(e) = sheet_adapter.format(sheet, &ordered_links).await {
        // Best-effort: formatting failure is logged, never propagated (spec §4.5).
        warn!(sheet_id = %sheet.id, error = %e, "sheet colour formatting failed");
    }

    if let Some(reason) = write_failed {
        sheet.status = SheetStatus::Error;
        let _ = repository.upsert_sheet(sheet).await;
        let _ = notifier
            .publish(sheet.project_id, Event::SheetRunFailed { sheet_id: sheet.id, reason })
            .await;
        tasks.lock().await.remove(&sheet.id);
        return;
    }

    sheet.status = SheetStatus::Checked;
    sheet.run_count += 1;
    sheet.last_run = Some(Utc::now());
    sheet.next_run = sheet.interval.advance(Utc::now());
    let _ = repository.upsert_sheet(sheet).await;

    let _ = notifier
        .publish(
            sheet.project_id,
            Event::SheetRunCompleted {
                sheet_id: sheet.id,
                link_count: ordered_links.len(),
            },
        )
        .await;

    let mut tasks = tasks.lock().await;
    match sheet.next_run {
        Some(next_fire_at) => {
            if let Some(task) = tasks.get_mut(&sheet.id) {
                task.last_fire_at = Some(Utc::now());
                task.fire_count += 1;
                task.next_fire_at = next_fire_at;
            }
        }
        None => {
            tasks.remove(&sheet.id);
        }
    }
}
