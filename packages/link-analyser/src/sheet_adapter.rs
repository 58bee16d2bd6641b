//! Sheet Adapter (C7, spec §4.7): bidirectional bridge to a spreadsheet backend.
//!
//! No vendored Sheets SDK exists anywhere in the surrounding stack, so — following the same
//! pattern as the rendering proxy — this talks to the Sheets REST API directly over `reqwest`
//! rather than pulling in a client library.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::domain::{Link, LinkClass, Sheet, RESULT_RANGE_COLUMNS};
use crate::error::BackendUnavailable;

/// One row read from a sheet's URL and target columns. `target_domain` is already resolved to
/// the sheet's configured default when the row left its own target column blank (spec §4.5:
/// "missing per-row target falls back to default") — callers never see an empty string here.
#[derive(Debug, Clone)]
pub struct SheetRow {
    pub source_url: String,
    pub target_domain: String,
}

/// Capability: read a sheet's input rows and write verdicts back into its result range.
#[async_trait]
pub trait SheetAdapter: Send + Sync {
    async fn read_rows(&self, sheet: &Sheet) -> Result<Vec<SheetRow>, BackendUnavailable>;

    /// Writes one row's result into `row_index`'s result range (spec §3, §6:
    /// Status, ResponseCode, Indexable, NonIndexableReason, LinkFound — in that column order,
    /// matching [`RESULT_RANGE_COLUMNS`]). `row_index` is 1-based and already accounts for the
    /// skipped header row (data starts at row 2).
    async fn write_result(
        &self,
        sheet: &Sheet,
        row_index: usize,
        link: &Link,
    ) -> Result<(), BackendUnavailable>;

    /// Applies the spec §4.6 colour convention (green `ok`, yellow `ok+canonicalised`, red
    /// `problem`, grey header) over the written rows. Best-effort: callers log failure here,
    /// they never fail the run over it (spec §4.5: "the latter is best-effort").
    async fn format(&self, sheet: &Sheet, links: &[Link]) -> Result<(), BackendUnavailable> {
        let _ = (sheet, links);
        Ok(())
    }
}

/// Row→cell-values mapping shared by every `SheetAdapter`, so the REST implementation and any
/// in-memory test double agree on column order and literal values (spec §6 write schema).
pub fn result_row_values(link: &Link) -> Vec<String> {
    let checked_at = link
        .checked_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    let link_found = !matches!(link.link_class, Some(LinkClass::Absent) | None);
    let values = vec![
        format!("{:?}", link.state).to_lowercase(),
        link.response_code.map(|c| c.to_string()).unwrap_or_default(),
        if link.indexable == Some(true) { "Yes" } else { "No" }.to_string(),
        link.non_indexable_reason.clone().unwrap_or_default(),
        format!(
            "{} ({checked_at})",
            if link_found { "True" } else { "False" }
        ),
    ];
    debug_assert_eq!(values.len(), RESULT_RANGE_COLUMNS);
    values
}

/// Colour this row gets in the spec §4.6 write-back convention.
pub fn row_colour(link: &Link) -> &'static str {
    use crate::domain::LinkState;
    match link.state {
        LinkState::Ok if link.non_indexable_reason.as_deref() == Some("canonicalised") => "yellow",
        LinkState::Ok => "green",
        LinkState::Problem => "red",
        LinkState::Pending | LinkState::Running => "grey",
    }
}

#[derive(Deserialize)]
struct ValueRangeResponse {
    values: Option<Vec<Vec<String>>>,
}

/// REST-backed adapter against a Google-Sheets-like `values`/`batchFormat` API
/// (`GetMetadata`, `ReadRange`, `UpdateRange`, `BatchFormat` from spec §6), authenticated with
/// a bearer token.
pub struct HttpSheetAdapter {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
}

impl HttpSheetAdapter {
    pub fn new(api_base: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            api_token: api_token.into(),
        }
    }

    fn input_range(&self, sheet: &Sheet) -> String {
        format!("{}:{}", sheet.url_column, sheet.target_column)
    }
}

#[async_trait]
impl SheetAdapter for HttpSheetAdapter {
    async fn read_rows(&self, sheet: &Sheet) -> Result<Vec<SheetRow>, BackendUnavailable> {
        let url = format!(
            "{}/{}/values/{}",
            self.api_base,
            sheet.spreadsheet_ref,
            self.input_range(sheet)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| BackendUnavailable(format!("sheet read failed: {e}")))?;

        let parsed: ValueRangeResponse = response
            .json()
            .await
            .map_err(|e| BackendUnavailable(format!("sheet response not json: {e}")))?;

        // Header row is skipped (spec §4.5): Sheets' values API returns it as the first row.
        // The range is `urlCol:targetCol`, so column 0 is the source URL and column 1 is the
        // row's own target domain — blank or missing falls back to the sheet's default.
        let rows = parsed
            .values
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .filter_map(|row| {
                let source_url = row.first()?.clone();
                if source_url.trim().is_empty() {
                    return None;
                }
                let target_domain = row
                    .get(1)
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&sheet.target_domain)
                    .to_string();
                Some(SheetRow {
                    source_url,
                    target_domain,
                })
            })
            .collect();

        Ok(rows)
    }

    async fn write_result(
        &self,
        sheet: &Sheet,
        row_index: usize,
        link: &Link,
    ) -> Result<(), BackendUnavailable> {
        let first_col = sheet
            .result_range
            .first()
            .ok_or_else(|| BackendUnavailable("sheet has no result_range configured".into()))?;
        let last_col = sheet
            .result_range
            .last()
            .ok_or_else(|| BackendUnavailable("sheet has no result_range configured".into()))?;
        let range = format!("{first_col}{row_index}:{last_col}{row_index}");
        let url = format!("{}/{}/values/{}", self.api_base, sheet.spreadsheet_ref, range);

        let body = json!({ "values": [result_row_values(link)] });

        self.client
            .put(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendUnavailable(format!("sheet write failed: {e}")))?;

        Ok(())
    }

    async fn format(&self, sheet: &Sheet, links: &[Link]) -> Result<(), BackendUnavailable> {
        let requests: Vec<_> = links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                json!({
                    "row": i + 2,
                    "range": sheet.result_range,
                    "colour": row_colour(link),
                })
            })
            .collect();
        let url = format!("{}/{}/batchFormat", self.api_base, sheet.spreadsheet_ref);
        self.client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| BackendUnavailable(format!("sheet format failed: {e}")))?;
        Ok(())
    }
}

/// Test double returning a fixed row set and recording writes.
pub struct StaticSheetAdapter {
    rows: Vec<SheetRow>,
    pub writes: std::sync::Mutex<Vec<(usize, Link)>>,
}

impl StaticSheetAdapter {
    pub fn new(rows: Vec<SheetRow>) -> Self {
        Self {
            rows,
            writes: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SheetAdapter for StaticSheetAdapter {
    async fn read_rows(&self, _sheet: &Sheet) -> Result<Vec<SheetRow>, BackendUnavailable> {
        Ok(self.rows.clone())
    }

    async fn write_result(
        &self,
        _sheet: &Sheet,
        row_index: usize,
        link: &Link,
    ) -> Result<(), BackendUnavailable> {
        self.writes.lock().unwrap().push((row_index, link.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LinkClass, LinkKind, LinkState};
    use uuid::Uuid;

    fn sample_link(state: LinkState, link_class: LinkClass) -> Link {
        let mut link = Link::new_pending(
            Uuid::new_v4(),
            "https://src.example.com/a".to_string(),
            "target.com".to_string(),
            "target.com".to_string(),
            LinkKind::Sheet,
        );
        link.state = state;
        link.response_code = Some(200);
        link.indexable = Some(true);
        link.link_class = Some(link_class);
        link.checked_at = Some(chrono::Utc::now());
        link
    }

    #[test]
    fn result_row_values_has_five_columns_in_order() {
        let link = sample_link(LinkState::Ok, LinkClass::Dofollow);
        let values = result_row_values(&link);
        assert_eq!(values.len(), RESULT_RANGE_COLUMNS);
        assert_eq!(values[0], "ok");
        assert_eq!(values[1], "200");
        assert_eq!(values[2], "Yes");
        assert!(values[4].starts_with("True ("));
    }

    #[test]
    fn absent_link_reports_link_found_false() {
        let link = sample_link(LinkState::Problem, LinkClass::Absent);
        let values = result_row_values(&link);
        assert!(values[4].starts_with("False ("));
    }

    #[test]
    fn row_colour_distinguishes_canonicalised_from_plain_ok() {
        let mut canonicalised = sample_link(LinkState::Ok, LinkClass::Dofollow);
        canonicalised.non_indexable_reason = Some("canonicalised".to_string());
        assert_eq!(row_colour(&canonicalised), "yellow");

        let plain_ok = sample_link(LinkState::Ok, LinkClass::Dofollow);
        assert_eq!(row_colour(&plain_ok), "green");

        let problem = sample_link(LinkState::Problem, LinkClass::Absent);
        assert_eq!(row_colour(&problem), "red");
    }
}
