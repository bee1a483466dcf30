//! Fire-and-forget progress events for a UI or log consumer.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Processing,
    Validating,
    Completed,
    Failed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Processing => "processing",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<Uuid>,
}

impl ProgressEvent {
    pub fn new(status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            attempt: None,
            variant_index: None,
            candidate_id: None,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn variant(mut self, index: Option<u32>) -> Self {
        self.variant_index = index;
        self
    }

    pub fn candidate(mut self, id: Uuid) -> Self {
        self.candidate_id = Some(id);
        self
    }
}

/// Push side of the progress channel. Cloneable; a disabled sink drops
/// every event.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Send an event. A closed receiver is not an error.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
