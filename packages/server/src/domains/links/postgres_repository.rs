//! Postgres-backed `link_analyser::Repository`.
//!
//! `link-analyser` is intentionally storage-agnostic (no `sqlx` dependency); this adapter owns
//! the SQL and maps rows to/from the crate's plain domain types by hand, the same way
//! `kernel/jobs/job.rs` maps the `jobs` table without a derived `FromRow` for every enum column.

use std::sync::Arc;

use async_trait::async_trait;
use link_analyser::{
    BackendUnavailable, Interval, Link, LinkClass, LinkKind, LinkState, Plan, Priority, Repository,
    Sheet, SheetStatus,
};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::kernel::ServerKernel;

pub struct PostgresLinkRepository {
    kernel: Arc<ServerKernel>,
}

impl PostgresLinkRepository {
    pub fn new(kernel: Arc<ServerKernel>) -> Self {
        Self { kernel }
    }

    fn pool(&self) -> &PgPool {
        &self.kernel.db_pool
    }
}

fn err(e: impl std::fmt::Display) -> BackendUnavailable {
    BackendUnavailable(e.to_string())
}

fn link_kind_to_str(kind: LinkKind) -> &'static str {
    match kind {
        LinkKind::Batch => "batch",
        LinkKind::Sheet => "sheet",
    }
}

fn link_kind_from_str(s: &str) -> LinkKind {
    match s {
        "sheet" => LinkKind::Sheet,
        _ => LinkKind::Batch,
    }
}

fn link_state_to_str(state: LinkState) -> &'static str {
    match state {
        LinkState::Pending => "pending",
        LinkState::Running => "running",
        LinkState::Ok => "ok",
        LinkState::Problem => "problem",
    }
}

fn link_state_from_str(s: &str) -> LinkState {
    match s {
        "running" => LinkState::Running,
        "ok" => LinkState::Ok,
        "problem" => LinkState::Problem,
        _ => LinkState::Pending,
    }
}

fn link_class_to_str(class: LinkClass) -> &'static str {
    match class {
        LinkClass::Dofollow => "dofollow",
        LinkClass::Nofollow => "nofollow",
        LinkClass::Sponsored => "sponsored",
        LinkClass::Ugc => "ugc",
        LinkClass::Absent => "absent",
    }
}

fn link_class_from_str(s: &str) -> LinkClass {
    match s {
        "nofollow" => LinkClass::Nofollow,
        "sponsored" => LinkClass::Sponsored,
        "ugc" => LinkClass::Ugc,
        "absent" => LinkClass::Absent,
        _ => LinkClass::Dofollow,
    }
}

fn interval_to_str(interval: Interval) -> &'static str {
    match interval {
        Interval::Manual => "manual",
        Interval::FiveMinutes => "5m",
        Interval::ThirtyMinutes => "30m",
        Interval::OneHour => "1h",
        Interval::FourHours => "4h",
        Interval::EightHours => "8h",
        Interval::TwelveHours => "12h",
        Interval::OneDay => "1d",
        Interval::ThreeDays => "3d",
        Interval::OneWeek => "1w",
        Interval::OneMonth => "1M",
    }
}

fn interval_from_str(s: &str) -> Interval {
    match s {
        "5m" => Interval::FiveMinutes,
        "30m" => Interval::ThirtyMinutes,
        "1h" => Interval::OneHour,
        "4h" => Interval::FourHours,
        "8h" => Interval::EightHours,
        "12h" => Interval::TwelveHours,
        "1d" => Interval::OneDay,
        "3d" => Interval::ThreeDays,
        "1w" => Interval::OneWeek,
        "1M" => Interval::OneMonth,
        _ => Interval::Manual,
    }
}

fn sheet_status_to_str(status: SheetStatus) -> &'static str {
    match status {
        SheetStatus::NotStarted => "not_started",
        SheetStatus::Analysing => "analysing",
        SheetStatus::Checked => "checked",
        SheetStatus::Inactive => "inactive",
        SheetStatus::Error => "error",
    }
}

fn plan_from_str(s: &str) -> Plan {
    match s {
        "enterprise" => Plan::Enterprise,
        "pro" => Plan::Pro,
        "starter" => Plan::Starter,
        _ => Plan::Free,
    }
}

fn sheet_status_from_str(s: &str) -> SheetStatus {
    match s {
        "analysing" => SheetStatus::Analysing,
        "checked" => SheetStatus::Checked,
        "inactive" => SheetStatus::Inactive,
        "error" => SheetStatus::Error,
        _ => SheetStatus::NotStarted,
    }
}

fn row_to_link(row: &sqlx::postgres::PgRow) -> Link {
    Link {
        id: row.get("id"),
        project_id: row.get("project_id"),
        source_url: row.get("source_url"),
        target_domain: row.get("target_domain"),
        original_target_domain: row.get("original_target_domain"),
        kind: link_kind_from_str(row.get("kind")),
        state: link_state_from_str(row.get("state")),
        response_code: row.get("response_code"),
        indexable: row.get("indexable"),
        link_class: row
            .get::<Option<String>, _>("link_class")
            .map(|s| link_class_from_str(&s)),
        canonical_url: row.get("canonical_url"),
        load_time_ms: row.get("load_time_ms"),
        matched_anchor_html: row.get("matched_anchor_html"),
        non_indexable_reason: row.get("non_indexable_reason"),
        checked_at: row.get("checked_at"),
    }
}

fn row_to_sheet(row: &sqlx::postgres::PgRow) -> Sheet {
    let result_range: String = row.get("result_range");
    Sheet {
        id: row.get("id"),
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        spreadsheet_ref: row.get("spreadsheet_ref"),
        target_domain: row.get("target_domain"),
        url_column: row.get("url_column"),
        target_column: row.get("target_column"),
        result_range: result_range.split(',').map(str::to_string).collect(),
        interval: interval_from_str(row.get("interval")),
        status: sheet_status_from_str(row.get("status")),
        last_run: row.get("last_run"),
        next_run: row.get("next_run"),
        run_count: row.get("run_count"),
    }
}

#[async_trait]
impl Repository for PostgresLinkRepository {
    async fn upsert_link(&self, link: &Link) -> Result<(), BackendUnavailable> {
        sqlx::query(
            r#"
            INSERT INTO links (
                id, project_id, source_url, target_domain, original_target_domain, kind, state,
                response_code, indexable, link_class, canonical_url, load_time_ms,
                matched_anchor_html, non_indexable_reason, checked_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                response_code = EXCLUDED.response_code,
                indexable = EXCLUDED.indexable,
                link_class = EXCLUDED.link_class,
                canonical_url = EXCLUDED.canonical_url,
                load_time_ms = EXCLUDED.load_time_ms,
                matched_anchor_html = EXCLUDED.matched_anchor_html,
                non_indexable_reason = EXCLUDED.non_indexable_reason,
                checked_at = EXCLUDED.checked_at
            "#,
        )
        .bind(link.id)
        .bind(link.project_id)
        .bind(&link.source_url)
        .bind(&link.target_domain)
        .bind(&link.original_target_domain)
        .bind(link_kind_to_str(link.kind))
        .bind(link_state_to_str(link.state))
        .bind(link.response_code)
        .bind(link.indexable)
        .bind(link.link_class.map(link_class_to_str))
        .bind(&link.canonical_url)
        .bind(link.load_time_ms)
        .bind(&link.matched_anchor_html)
        .bind(&link.non_indexable_reason)
        .bind(link.checked_at)
        .execute(self.pool())
        .await
        .map_err(err)?;
        Ok(())
    }

    async fn get_link(&self, id: Uuid) -> Result<Option<Link>, BackendUnavailable> {
        let row = sqlx::query("SELECT * FROM links WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(err)?;
        Ok(row.as_ref().map(row_to_link))
    }

    async fn links_for_project(&self, project_id: Uuid) -> Result<Vec<Link>, BackendUnavailable> {
        let rows = sqlx::query("SELECT * FROM links WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(self.pool())
            .await
            .map_err(err)?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn list_by_project_and_kind(
        &self,
        project_id: Uuid,
        kind: LinkKind,
    ) -> Result<Vec<Link>, BackendUnavailable> {
        let rows = sqlx::query("SELECT * FROM links WHERE project_id = $1 AND kind = $2")
            .bind(project_id)
            .bind(link_kind_to_str(kind))
            .fetch_all(self.pool())
            .await
            .map_err(err)?;
        Ok(rows.iter().map(row_to_link).collect())
    }

    async fn reset_analysis(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable> {
        let result = sqlx::query(
            r#"
            UPDATE links
            SET state = 'pending', response_code = NULL, indexable = NULL, link_class = NULL,
                canonical_url = NULL, load_time_ms = NULL, matched_anchor_html = NULL,
                non_indexable_reason = NULL, checked_at = NULL
            WHERE project_id = $1 AND kind = $2
            "#,
        )
        .bind(project_id)
        .bind(link_kind_to_str(kind))
        .execute(self.pool())
        .await
        .map_err(err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_links_by_kind(&self, project_id: Uuid, kind: LinkKind) -> Result<usize, BackendUnavailable> {
        let result = sqlx::query("DELETE FROM links WHERE project_id = $1 AND kind = $2")
            .bind(project_id)
            .bind(link_kind_to_str(kind))
            .execute(self.pool())
            .await
            .map_err(err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_user_priority(&self, user_id: Uuid) -> Result<Priority, BackendUnavailable> {
        let row = sqlx::query("SELECT plan FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await
            .map_err(err)?;
        Ok(match row {
            Some(row) => Priority::from_plan(plan_from_str(row.get("plan"))),
            None => Priority::from_plan(Plan::Free),
        })
    }

    async fn upsert_sheet(&self, sheet: &Sheet) -> Result<(), BackendUnavailable> {
        sqlx::query(
            r#"
            INSERT INTO sheets (
                id, project_id, user_id, spreadsheet_ref, target_domain, url_column,
                target_column, result_range, interval, status, last_run, next_run, run_count
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                last_run = EXCLUDED.last_run,
                next_run = EXCLUDED.next_run,
                run_count = EXCLUDED.run_count,
                interval = EXCLUDED.interval
            "#,
        )
        .bind(sheet.id)
        .bind(sheet.project_id)
        .bind(sheet.user_id)
        .bind(&sheet.spreadsheet_ref)
        .bind(&sheet.target_domain)
        .bind(&sheet.url_column)
        .bind(&sheet.target_column)
        .bind(sheet.result_range.join(","))
        .bind(interval_to_str(sheet.interval))
        .bind(sheet_status_to_str(sheet.status))
        .bind(sheet.last_run)
        .bind(sheet.next_run)
        .bind(sheet.run_count)
        .execute(self.pool())
        .await
        .map_err(err)?;
        Ok(())
    }

    async fn get_sheet(&self, id: Uuid) -> Result<Option<Sheet>, BackendUnavailable> {
        let row = sqlx::query("SELECT * FROM sheets WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(err)?;
        Ok(row.as_ref().map(row_to_sheet))
    }

    async fn active_sheets(&self) -> Result<Vec<Sheet>, BackendUnavailable> {
        let rows = sqlx::query(
            "SELECT * FROM sheets WHERE interval <> 'manual' AND status <> 'inactive'",
        )
        .fetch_all(self.pool())
        .await
        .map_err(err)?;
        Ok(rows.iter().map(row_to_sheet).collect())
    }

    async fn project_batch_is_complete(
        &self,
        project_id: Uuid,
        kind: LinkKind,
    ) -> Result<bool, BackendUnavailable> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE state NOT IN ('ok', 'problem')) AS unfinished,
                   COUNT(*) AS total
            FROM links
            WHERE project_id = $1 AND kind = $2
            "#,
        )
        .bind(project_id)
        .bind(link_kind_to_str(kind))
        .fetch_one(self.pool())
        .await
        .map_err(err)?;

        let unfinished: i64 = row.get("unfinished");
        let total: i64 = row.get("total");
        Ok(total > 0 && unfinished == 0)
    }
}
