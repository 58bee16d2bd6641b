//! SSE streaming endpoint — the real-time fan-out channel observers subscribe to (spec §2 C2).
//!
//! GET /api/projects/:project_id/stream
//!
//! Subscribes to the kernel's StreamHub on topic `project:{id}` and forwards every
//! `link_updated`/`analysis_*`/`sheets_*` event (spec §4.6) as an SSE event named after its
//! `type` field. Request routing/auth around this endpoint is an external collaborator (spec
//! §1 "out of scope") the core doesn't implement; this handler is the minimal bridge from the
//! StreamHub topic to the wire.

use std::convert::Infallible;

use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::server::app::AxumAppState;

pub async fn stream_handler(
    Extension(state): Extension<AxumAppState>,
    Path(project_id): Path<Uuid>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let topic = format!("project:{project_id}");
    let rx = state.stream_hub.subscribe(&topic).await;

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(value) => {
                let event_name = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("message");
                Event::default()
                    .event(event_name)
                    .json_data(&value)
                    .ok()
                    .map(Ok)
            }
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                Event::default()
                    .event("lagged")
                    .json_data(&serde_json::json!({"missed": n}))
                    .ok()
                    .map(Ok)
            }
        }
    });

    Sse::new(connected.chain(events)).keep_alive(KeepAlive::default())
}
