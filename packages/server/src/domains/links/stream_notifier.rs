//! `link_analyser::Notifier` over the kernel's topic-keyed `StreamHub`.
//!
//! Topics are `project:{id}`, matching the wire convention the rest of the server's SSE
//! endpoints already use (spec'd in the crate as `Message bus: Publish(topic, event); topic is
//! project:{id}`).

use async_trait::async_trait;
use link_analyser::{BackendUnavailable, Event, Notifier};
use serde_json::json;
use uuid::Uuid;

use crate::kernel::stream_hub::StreamHub;

pub struct StreamHubNotifier {
    hub: StreamHub,
}

impl StreamHubNotifier {
    pub fn new(hub: StreamHub) -> Self {
        Self { hub }
    }
}

fn event_to_json(event: &Event) -> serde_json::Value {
    match event {
        Event::JobQueued { job_id, project_id } => json!({
            "type": "job_queued", "jobId": job_id, "projectId": project_id,
        }),
        Event::BatchRunStarted { project_id } => json!({
            "type": "analysis_started", "projectId": project_id,
        }),
        Event::JobStarted { job_id } => json!({
            "type": "analysis_progress", "jobId": job_id,
        }),
        Event::JobSucceeded { job_id, verdict } => json!({
            "type": "link_updated",
            "jobId": job_id,
            "status": format!("{:?}", verdict.state).to_lowercase(),
            "responseCode": verdict.response_code,
            "indexable": verdict.indexable,
            "linkClass": format!("{:?}", verdict.link_class).to_lowercase(),
            "canonicalUrl": verdict.canonical_url,
            "loadTime": verdict.load_time_ms,
            "matchedAnchorHtml": verdict.matched_anchor_html,
            "nonIndexableReason": verdict.non_indexable_reason,
        }),
        Event::JobFailed { job_id, reason } => json!({
            "type": "analysis_error", "jobId": job_id, "reason": reason,
        }),
        Event::JobDeadLettered { job_id } => json!({
            "type": "analysis_error", "jobId": job_id, "reason": "dead_lettered",
        }),
        Event::BatchCompleted { project_id, link_count } => json!({
            "type": "analysis_completed", "projectId": project_id, "linkCount": link_count,
        }),
        Event::SheetRunStarted { sheet_id } => json!({
            "type": "sheets_analysis_started", "sheetId": sheet_id,
        }),
        Event::SheetRunCompleted { sheet_id, link_count } => json!({
            "type": "sheets_analysis_completed", "sheetId": sheet_id, "linkCount": link_count,
        }),
        Event::SheetRunFailed { sheet_id, reason } => json!({
            "type": "sheets_analysis_error", "sheetId": sheet_id, "reason": reason,
        }),
    }
}

#[async_trait]
impl Notifier for StreamHubNotifier {
    async fn publish(&self, project_id: Uuid, event: Event) -> Result<(), BackendUnavailable> {
        let topic = format!("project:{project_id}");
        self.hub.publish(&topic, event_to_json(&event)).await;
        Ok(())
    }
}
