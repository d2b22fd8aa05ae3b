//! Pipeline events and the per-session event channel
//!
//! A pipeline run produces two kinds of events: coarse progress checkpoints
//! and individual log lines. Both travel through one ordered channel per
//! session, so the subscriber sees them exactly in the order they were
//! generated.
//!
//! Serialized form (one event per SSE message):
//! ```json
//! {"type": "progress", "data": {"percent": 50, "text": "Training NeRF model"}}
//! {"type": "log", "data": "Iteration 100 loss=0.021"}
//! {"type": "progress", "data": {"percent": 100, "text": "Done", "status": "success"}}
//! ```
//!
//! # Guarantees
//! - Events are delivered in emission order.
//! - `percent` never decreases within a session; lower values are clamped.
//! - Nothing is delivered after the terminal progress event.
//! - The queue is bounded; producers wait for capacity instead of dropping.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Final outcome carried by a terminal progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Payload of a `progress` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    /// 0-100, non-decreasing within a session
    pub percent: u8,
    /// Human-readable status text
    pub text: String,
    /// Present only on the terminal event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

/// Event delivered to the session subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PipelineEvent {
    Progress(ProgressData),
    Log(String),
}

impl PipelineEvent {
    /// Event type name as it appears on the wire
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::Progress(_) => "progress",
            PipelineEvent::Log(_) => "log",
        }
    }

    /// True for the progress event that ends a session stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Progress(ProgressData {
                status: Some(_),
                ..
            })
        )
    }

    /// Status of a terminal event
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            PipelineEvent::Progress(data) => data.status,
            PipelineEvent::Log(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    last_percent: AtomicU8,
    terminated: AtomicBool,
    subscriber_gone: AtomicBool,
}

/// Sending half of a session event channel
///
/// Cloned into the orchestrator and the stage runner; all clones share the
/// same ordering, percentage and termination state.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<PipelineEvent>,
    state: Arc<PublisherState>,
}

/// Receiving half of a session event channel
///
/// Yields `None` once the terminal progress event has been returned, or
/// when every publisher is gone.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<PipelineEvent>,
    finished: bool,
}

/// Create a bounded event channel for one session
///
/// # Panics
/// Panics if `capacity` is 0 (same as `tokio::sync::mpsc::channel`).
pub fn event_channel(capacity: usize) -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventPublisher {
            tx,
            state: Arc::new(PublisherState::default()),
        },
        EventStream { rx, finished: false },
    )
}

impl EventPublisher {
    /// Emit one event, waiting for queue capacity
    ///
    /// Returns `false` if the event was not delivered: the stream already
    /// terminated or the subscriber disconnected. Neither case is an error
    /// for the producer.
    pub async fn emit(&self, event: PipelineEvent) -> bool {
        let event = match event {
            PipelineEvent::Progress(mut data) => {
                if self.state.terminated.load(Ordering::SeqCst) {
                    debug!("Dropping progress event after terminal event: {}", data.text);
                    return false;
                }

                data.percent = data.percent.min(100);
                let previous = self.state.last_percent.fetch_max(data.percent, Ordering::SeqCst);
                if data.percent < previous {
                    warn!(
                        requested = data.percent,
                        current = previous,
                        "Progress would go backwards, clamping"
                    );
                    data.percent = previous;
                }

                if data.status.is_some() && self.state.terminated.swap(true, Ordering::SeqCst) {
                    debug!("Terminal event already emitted, dropping: {}", data.text);
                    return false;
                }
                PipelineEvent::Progress(data)
            }
            PipelineEvent::Log(line) => {
                if self.state.terminated.load(Ordering::SeqCst) {
                    debug!("Dropping log line after terminal event: {}", line);
                    return false;
                }
                PipelineEvent::Log(line)
            }
        };

        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                if !self.state.subscriber_gone.swap(true, Ordering::SeqCst) {
                    debug!("Event subscriber disconnected, further events are discarded");
                }
                false
            }
        }
    }

    /// Emit a `log` event
    pub async fn log(&self, line: impl Into<String>) -> bool {
        self.emit(PipelineEvent::Log(line.into())).await
    }

    /// Emit a non-terminal `progress` event
    pub async fn progress(&self, percent: u8, text: impl Into<String>) -> bool {
        self.emit(PipelineEvent::Progress(ProgressData {
            percent,
            text: text.into(),
            status: None,
        }))
        .await
    }

    /// Emit the terminal success event (`percent = 100`)
    pub async fn succeed(&self, text: impl Into<String>) -> bool {
        self.emit(PipelineEvent::Progress(ProgressData {
            percent: 100,
            text: text.into(),
            status: Some(RunStatus::Success),
        }))
        .await
    }

    /// Emit the terminal failure event
    pub async fn fail(&self, text: impl Into<String>) -> bool {
        self.emit(PipelineEvent::Progress(ProgressData {
            percent: 100,
            text: text.into(),
            status: Some(RunStatus::Failed),
        }))
        .await
    }

    /// Emit a diagnostic log line (plus optional detail) and then the
    /// terminal failure event
    pub async fn fail_with_diagnostic(
        &self,
        summary: &str,
        detail: Option<&str>,
        text: impl Into<String>,
    ) -> bool {
        self.log(format!("Fatal error: {}", summary)).await;
        if let Some(detail) = detail {
            self.log(detail.to_string()).await;
        }
        self.fail(text).await
    }

    /// True once a terminal progress event has been emitted
    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    /// Highest percentage emitted so far
    pub fn last_percent(&self) -> u8 {
        self.state.last_percent.load(Ordering::SeqCst)
    }

    /// True once a send has failed because the subscriber went away
    pub fn subscriber_gone(&self) -> bool {
        self.state.subscriber_gone.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

impl EventStream {
    /// Receive the next event in emission order
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        if self.finished {
            return None;
        }

        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Some(event)
    }

    /// True once the terminal event has been received
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
