//! Lifecycle events streamed from a provisioning run to its consumer.
//!
//! On the wire each event is `{"event": "<name>", "payload": {...}}` with
//! camelCase payload keys, which is what a webview or IPC bridge forwards.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStart {
    pub tool: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProgressUpdate {
    pub tool: String,
    pub received: u64,
    /// `0` when the server sent no length.
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolComplete {
    pub tool: String,
}

/// A per-tool failure, also collected into [`UpdateSummary::failures`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub tool: String,
    pub version: String,
    pub stage: String,
    pub error: String,
}

impl ToolError {
    /// The `"[stage] message"` form shown next to the tool.
    pub fn display_message(&self) -> String {
        format!("[{}] {}", self.stage, self.error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub successes: Vec<String>,
    pub failures: Vec<ToolError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BinaryEvent {
    #[serde(rename = "binary_download_start")]
    Start(ToolStart),

    #[serde(rename = "binary_download_progress")]
    Progress(ToolProgressUpdate),

    #[serde(rename = "binary_download_complete")]
    Complete(ToolComplete),

    #[serde(rename = "binary_download_error")]
    Error(ToolError),

    /// Emitted once after a run with the outcome of every planned tool.
    #[serde(rename = "binary_update_complete")]
    UpdateComplete(UpdateSummary),
}

impl BinaryEvent {
    pub fn start(tool: impl Into<String>, version: impl Into<String>) -> Self {
        Self::Start(ToolStart {
            tool: tool.into(),
            version: version.into(),
        })
    }

    pub fn progress(tool: impl Into<String>, received: u64, total: u64) -> Self {
        Self::Progress(ToolProgressUpdate {
            tool: tool.into(),
            received,
            total,
        })
    }

    pub fn complete(tool: impl Into<String>) -> Self {
        Self::Complete(ToolComplete { tool: tool.into() })
    }

    pub fn error(
        tool: impl Into<String>,
        version: impl Into<String>,
        stage: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::Error(ToolError {
            tool: tool.into(),
            version: version.into(),
            stage: stage.into(),
            error: error.into(),
        })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "binary_download_start",
            Self::Progress(_) => "binary_download_progress",
            Self::Complete(_) => "binary_download_complete",
            Self::Error(_) => "binary_download_error",
            Self::UpdateComplete(_) => "binary_update_complete",
        }
    }

    /// The tool this event concerns, if it is a per-tool event.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::Start(p) => Some(&p.tool),
            Self::Progress(p) => Some(&p.tool),
            Self::Complete(p) => Some(&p.tool),
            Self::Error(p) => Some(&p.tool),
            Self::UpdateComplete(_) => None,
        }
    }
}

// =============================================================================
// Channel Types
// =============================================================================

/// Sender for provisioning events.
pub type EventSender = mpsc::UnboundedSender<BinaryEvent>;

/// Receiver for provisioning events.
pub type EventReceiver = mpsc::UnboundedReceiver<BinaryEvent>;

/// Create an event channel for streaming provisioning events.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_channel() {
        let (tx, mut rx) = event_channel();
        tx.send(BinaryEvent::complete("yt-dlp")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BinaryEvent::complete("yt-dlp"));
    }

    #[test]
    fn test_progress_wire_shape() {
        let event = BinaryEvent::progress("ffmpeg", 512, 2048);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "binary_download_progress",
                "payload": {"tool": "ffmpeg", "received": 512, "total": 2048}
            })
        );
    }

    #[test]
    fn test_error_roundtrip_from_wire() {
        let wire = json!({
            "event": "binary_download_error",
            "payload": {"tool": "ffprobe", "version": "7.1", "stage": "verify", "error": "bad hash"}
        });
        let event: BinaryEvent = serde_json::from_value(wire).unwrap();
        match &event {
            BinaryEvent::Error(e) => assert_eq!(e.display_message(), "[verify] bad hash"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(event.tool(), Some("ffprobe"));
        assert_eq!(event.name(), "binary_download_error");
    }

    #[test]
    fn test_update_summary_omits_absent_error() {
        let event = BinaryEvent::UpdateComplete(UpdateSummary {
            successes: vec!["yt-dlp".into()],
            failures: vec![],
            error: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "binary_update_complete");
        assert!(value["payload"].get("error").is_none());
        assert_eq!(event.tool(), None);
    }
}
