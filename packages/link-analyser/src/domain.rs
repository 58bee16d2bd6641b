//! Core data model: `Link`, `Sheet`, `Job`, `ScheduledTask`.
//!
//! These mirror the entities a caller persists through the [`crate::repository::Repository`]
//! trait. The crate itself is storage-agnostic; concrete backends (Postgres, in-memory) live
//! with the capability implementations a binary wires together at startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which producer created a job/link row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Batch,
    Sheet,
}

/// Lifecycle state of a `Link` row. Terminal states (`Ok`, `Problem`) are reached exactly
/// once per analysis run; going back to `Pending`/`Running` only happens via an explicit
/// reset (see `Repository::reset_analysis`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Pending,
    Running,
    Ok,
    Problem,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Ok | LinkState::Problem)
    }
}

/// Classification of the matched anchor(s), or `Absent` when none matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    Dofollow,
    Nofollow,
    Sponsored,
    Ugc,
    Absent,
}

impl LinkClass {
    /// `rel` precedence from §4.3 step 3: sponsored > ugc > nofollow, with dofollow winning
    /// only when no sibling carries `nofollow`/`sponsored`/`ugc`.
    pub fn from_rel_tokens<'a>(rel_tokens: impl Iterator<Item = &'a str>) -> LinkClass {
        let mut sponsored = false;
        let mut ugc = false;
        let mut nofollow = false;
        for token in rel_tokens {
            match token {
                "sponsored" => sponsored = true,
                "ugc" => ugc = true,
                "nofollow" => nofollow = true,
                _ => {}
            }
        }
        if sponsored {
            LinkClass::Sponsored
        } else if ugc {
            LinkClass::Ugc
        } else if nofollow {
            LinkClass::Nofollow
        } else {
            LinkClass::Dofollow
        }
    }
}

/// `Link` — one `(source_url, target_domain)` audit row. See spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_url: String,
    /// Registrable host, lowercased, leading `www.` stripped.
    pub target_domain: String,
    /// The user-supplied string, preserved verbatim.
    pub original_target_domain: String,
    pub kind: LinkKind,
    pub state: LinkState,
    pub response_code: Option<i32>,
    pub indexable: Option<bool>,
    pub link_class: Option<LinkClass>,
    pub canonical_url: Option<String>,
    pub load_time_ms: Option<i64>,
    pub matched_anchor_html: Option<String>,
    pub non_indexable_reason: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl Link {
    pub fn new_pending(
        project_id: Uuid,
        source_url: String,
        target_domain: String,
        original_target_domain: String,
        kind: LinkKind,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            project_id,
            source_url,
            target_domain,
            original_target_domain,
            kind,
            state: LinkState::Pending,
            response_code: None,
            indexable: None,
            link_class: None,
            canonical_url: None,
            load_time_ms: None,
            matched_anchor_html: None,
            non_indexable_reason: None,
            checked_at: None,
        }
    }

    /// Reset to the start-of-run epoch: clears every verdict field. Used by
    /// `Repository::reset_analysis` ahead of a new run so in-flight jobs from a prior run can
    /// never mutate rows belonging to the new one (spec §5, "happens-before barrier").
    pub fn reset(&mut self) {
        self.state = LinkState::Pending;
        self.response_code = None;
        self.indexable = None;
        self.link_class = None;
        self.canonical_url = None;
        self.load_time_ms = None;
        self.matched_anchor_html = None;
        self.non_indexable_reason = None;
        self.checked_at = None;
    }
}

/// Recurring interval a `Sheet` is checked on. `Manual` never arms a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Manual,
    FiveMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    EightHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
    OneMonth,
}

impl Interval {
    /// Next fire time from `from`. `OneMonth` advances the calendar month field, clamping to
    /// the last day of the target month (so Jan 31 + 1M -> Feb 28/29).
    pub fn advance(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        use chrono::Duration;
        match self {
            Interval::Manual => None,
            Interval::FiveMinutes => Some(from + Duration::minutes(5)),
            Interval::ThirtyMinutes => Some(from + Duration::minutes(30)),
            Interval::OneHour => Some(from + Duration::hours(1)),
            Interval::FourHours => Some(from + Duration::hours(4)),
            Interval::EightHours => Some(from + Duration::hours(8)),
            Interval::TwelveHours => Some(from + Duration::hours(12)),
            Interval::OneDay => Some(from + Duration::days(1)),
            Interval::ThreeDays => Some(from + Duration::days(3)),
            Interval::OneWeek => Some(from + Duration::weeks(1)),
            Interval::OneMonth => Some(advance_one_month(from)),
        }
    }
}

fn advance_one_month(from: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, TimeZone};
    let mut year = from.year();
    let mut month = from.month();
    month += 1;
    if month > 12 {
        month = 1;
        year += 1;
    }
    let last_day = days_in_month(year, month);
    let day = from.day().min(last_day);
    Utc.with_ymd_and_hms(
        year,
        month,
        day,
        from.hour(),
        from.minute(),
        from.second(),
    )
    .single()
    .unwrap_or(from)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    use chrono::NaiveDate;
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap();
    let first_of_this = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (first_of_next - first_of_this).num_days() as u32
}

use chrono::Timelike;

/// Status of a `Sheet`'s most recent/ongoing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetStatus {
    NotStarted,
    Analysing,
    Checked,
    Inactive,
    Error,
}

/// Fixed width of the write-back range: Status, ResponseCode, Indexable, NonIndexableReason,
/// LinkFound. Invariant, enforced at sheet creation (`max_sheet_columns` = 5).
pub const RESULT_RANGE_COLUMNS: usize = 5;

/// `Sheet` — a recurring, spreadsheet-driven audit job. See spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub spreadsheet_ref: String,
    pub target_domain: String,
    pub url_column: String,
    pub target_column: String,
    /// Exactly `RESULT_RANGE_COLUMNS` contiguous columns, e.g. `["F", "G", "H", "I", "J"]`.
    pub result_range: Vec<String>,
    pub interval: Interval,
    pub status: SheetStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: i64,
}

impl Sheet {
    /// Validates the `|result_range| == 5` invariant at creation time.
    pub fn validate_result_range(range: &[String]) -> Result<(), crate::error::MalformedInput> {
        if range.len() != RESULT_RANGE_COLUMNS {
            return Err(crate::error::MalformedInput::InvalidResultRange {
                expected: RESULT_RANGE_COLUMNS,
                actual: range.len(),
            });
        }
        Ok(())
    }
}

/// `ScheduledTask` — the scheduler's in-memory record of an armed timer. At most one per sheet;
/// `next_fire_at` is mirrored into `Sheet.next_run` as an observable projection.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub sheet_id: Uuid,
    pub interval: Interval,
    pub next_fire_at: DateTime<Utc>,
    /// Opaque handle into whatever timer facility armed this task (e.g. a `tokio_cron_scheduler`
    /// job uuid). Not serialized; owned exclusively by the scheduler.
    pub timer_handle: Option<Uuid>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub fire_count: i64,
}

/// User plan tiers, mapped to queue priority at enqueue time (spec §3: enterprise=1 highest,
/// pro=2, starter=3, free=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Enterprise,
    Pro,
    Starter,
    Free,
}

/// Queue priority, 1 (highest) .. 4 (lowest). Ordering key is `(priority, enqueued_at)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const ENTERPRISE: Priority = Priority(1);
    pub const PRO: Priority = Priority(2);
    pub const STARTER: Priority = Priority(3);
    pub const FREE: Priority = Priority(4);

    pub fn from_plan(plan: Plan) -> Self {
        match plan {
            Plan::Enterprise => Priority::ENTERPRISE,
            Plan::Pro => Priority::PRO,
            Plan::Starter => Priority::STARTER,
            Plan::Free => Priority::FREE,
        }
    }
}

/// A job on the priority queue. `job_id` is deterministic from `(kind, source_url, project_id)`
/// so re-enqueuing within the same epoch is a no-op (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub kind: LinkKind,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub link_id: Option<Uuid>,
    pub sheet_id: Option<Uuid>,
    pub source_url: String,
    pub target_domain: String,
    pub priority: Priority,
    pub attempts: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Deterministic id from `(kind, source_url, project_id)` — UUIDv5 in a crate-private
    /// namespace so the same triple always yields the same id within an enqueue epoch.
    pub fn derive_job_id(kind: LinkKind, source_url: &str, project_id: Uuid) -> Uuid {
        const NAMESPACE: Uuid = Uuid::from_bytes([
            0x3b, 0x1a, 0x52, 0x9e, 0x6f, 0x0d, 0x4a, 0x83, 0x9c, 0x1e, 0x7a, 0x2d, 0x6e, 0x44,
            0x0b, 0x57,
        ]);
        let kind_tag = match kind {
            LinkKind::Batch => "batch",
            LinkKind::Sheet => "sheet",
        };
        let name = format!("{kind_tag}:{source_url}:{project_id}");
        Uuid::new_v5(&NAMESPACE, name.as_bytes())
    }

    pub fn new(
        kind: LinkKind,
        user_id: Uuid,
        project_id: Uuid,
        link_id: Option<Uuid>,
        sheet_id: Option<Uuid>,
        source_url: String,
        target_domain: String,
        priority: Priority,
    ) -> Self {
        let job_id = Self::derive_job_id(kind, &source_url, project_id);
        Self {
            job_id,
            kind,
            user_id,
            project_id,
            link_id,
            sheet_id,
            source_url,
            target_domain,
            priority,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// The analyser's structured output for one job (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub state: LinkState,
    pub response_code: i32,
    pub indexable: bool,
    pub link_class: LinkClass,
    pub canonical_url: Option<String>,
    pub load_time_ms: i64,
    pub matched_anchor_html: Option<String>,
    pub non_indexable_reason: Option<String>,
}

impl Verdict {
    pub fn apply_to(&self, link: &mut Link) {
        link.state = self.state;
        link.response_code = Some(self.response_code);
        link.indexable = Some(self.indexable);
        link.link_class = Some(self.link_class);
        link.canonical_url = self.canonical_url.clone();
        link.load_time_ms = Some(self.load_time_ms);
        link.matched_anchor_html = self.matched_anchor_html.clone();
        link.non_indexable_reason = self.non_indexable_reason.clone();
        link.checked_at = Some(Utc::now());
    }
}
