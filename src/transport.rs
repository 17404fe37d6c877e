//! Push-transport endpoint.
//!
//! Bridges one long-lived SSE connection to one broker subscription for a
//! job, with a periodic reconciliation poll against the job record and a
//! hard lifetime bound. The connection closes right after the first terminal
//! event, whichever path surfaces it, so a subscriber never sees two.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::api::{ApiError, SharedState};
use crate::broker::{EventBroker, SubscriberFn};
use crate::models::{Job, JobStatus, StreamEvent};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Cadence of the record-store reconciliation poll.
    pub poll_interval: Duration,
    /// Hard cap on connection lifetime regardless of job state.
    pub max_lifetime: Duration,
    /// Delay between flushing a terminal event and closing, so the transport
    /// can finish writing.
    pub close_grace: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_lifetime: Duration::from_secs(30),
            close_grace: Duration::from_millis(500),
        }
    }
}

/// `GET /api/jobs/{id}/stream`: stream a job's progress as SSE.
pub async fn stream_handler(
    Path(id): Path<String>,
    State(state): State<SharedState>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let job = state
        .store
        .get(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;

    let (out_tx, out_rx) = mpsc::unbounded_channel::<StreamEvent>();
    tokio::spawn(run_connection(
        Arc::clone(&state.store),
        Arc::clone(&state.broker),
        state.transport,
        job,
        out_tx,
    ));

    let stream = UnboundedReceiverStream::new(out_rx).map(|event| Event::default().json_data(&event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Drive one connection: initial status from the persisted record, then a
/// single `select!` loop over broker delivery, the reconciliation poll, and
/// the lifetime deadline. Exits silently when the peer goes away; a closed
/// connection is not an application error.
pub async fn run_connection(
    store: Arc<dyn JobStore>,
    broker: Arc<EventBroker>,
    config: TransportConfig,
    job: Job,
    out: mpsc::UnboundedSender<StreamEvent>,
) {
    let job_id = job.id.clone();

    // Covers observers that connect after the job already finished.
    let initial = StreamEvent::status(&job_id, job.status, "connected");
    if out.send(initial).is_err() {
        return;
    }

    // Subscribe even if the record is already terminal: a just-starting
    // regeneration may race the open-time read. The subscription replays any
    // accumulated code into the channel before we enter the loop.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let forward: SubscriberFn = Arc::new(move |event: &StreamEvent| {
        event_tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("connection channel closed"))
    });
    let subscription = broker.subscribe(&job_id, forward);

    let mut poll = tokio::time::interval(config.poll_interval);
    // The first tick completes immediately; consume it so the first real
    // poll fires after one interval has elapsed.
    poll.tick().await;

    let deadline = tokio::time::sleep(config.max_lifetime);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            // ── Broker push path ────────────────────────────────────
            delivered = event_rx.recv() => {
                let Some(event) = delivered else { break };
                let is_terminal = event.is_terminal();
                if out.send(event).is_err() {
                    // Peer closed; unsubscribe and stop polling.
                    break;
                }
                if is_terminal {
                    tokio::time::sleep(config.close_grace).await;
                    break;
                }
            }

            // ── Poll fallback against the durable record ────────────
            _ = poll.tick() => {
                match store.get(&job_id).await {
                    Ok(Some(record)) if record.status.is_terminal() => {
                        let _ = out.send(synthesize_terminal(&record));
                        tokio::time::sleep(config.close_grace).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, "Reconciliation poll failed: {:#}", e);
                    }
                }
            }

            // ── Hard lifetime bound ─────────────────────────────────
            _ = &mut deadline => {
                tracing::debug!(job_id = %job_id, "Connection hit lifetime bound, closing");
                break;
            }
        }
    }

    drop(subscription);
}

/// Build the terminal event an observer would have missed, from the durable
/// record alone.
fn synthesize_terminal(job: &Job) -> StreamEvent {
    match job.status {
        JobStatus::Generated => StreamEvent::complete(
            &job.id,
            job.generated_code.clone().unwrap_or_default(),
        ),
        JobStatus::Failed => StreamEvent::error(
            &job.id,
            job.error_message
                .clone()
                .unwrap_or_else(|| "generation failed".to_string()),
        ),
        JobStatus::Generating => StreamEvent::status(&job.id, job.status, "generating"),
    }
}
