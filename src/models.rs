use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Job record ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Generating,
    Generated,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Generated => "generated",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses never revert to `Generating`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Generated | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(Self::Generating),
            "generated" => Ok(Self::Generated),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Accounting and diagnostics accumulated by the pipeline. All fields are
/// optional-with-default so partial patches merge cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    /// Failed generation attempts before the outcome.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub auto_fix_attempted: bool,
    #[serde(default)]
    pub auto_fix_applied: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub outline: String,
    pub generated_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-run knobs accepted by the pipeline trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Fetch illustrative images before generating. Best-effort; failures
    /// never fail the job.
    #[serde(default)]
    pub with_images: bool,
}

// ── Stream events ─────────────────────────────────────────────────────

/// One unit of the wire protocol: a typed progress/result notification for a
/// single job. Events for one job reach any given subscriber in emission
/// order; nothing is promised across jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// Coarse phase transition.
    #[serde(rename = "status")]
    Status { status: JobStatus, message: String },

    /// Incremental code delta; consumers append.
    #[serde(rename = "code-chunk")]
    CodeChunk { code: String },

    /// Full-buffer replacement; consumers discard what they have. Used for
    /// replay-on-subscribe and post-auto-fix reconciliation.
    #[serde(rename = "code-update")]
    CodeUpdate { code: String },

    /// Terminal success carrying the authoritative final code.
    #[serde(rename = "complete")]
    Complete {
        code: String,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Terminal failure.
    #[serde(rename = "error")]
    Error { message: String },
}

impl StreamEvent {
    pub fn new(job_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn status(job_id: impl Into<String>, status: JobStatus, message: impl Into<String>) -> Self {
        Self::new(
            job_id,
            EventPayload::Status {
                status,
                message: message.into(),
            },
        )
    }

    pub fn chunk(job_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(job_id, EventPayload::CodeChunk { code: code.into() })
    }

    pub fn update(job_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(job_id, EventPayload::CodeUpdate { code: code.into() })
    }

    pub fn complete(job_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            job_id,
            EventPayload::Complete {
                code: code.into(),
                status: JobStatus::Generated,
                error: None,
            },
        )
    }

    pub fn error(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            job_id,
            EventPayload::Error {
                message: message.into(),
            },
        )
    }

    /// Whether this event ends the stream for its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Complete { .. } | EventPayload::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for s in ["generating", "generated", "failed"] {
            let status: JobStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Generating.is_terminal());
        assert!(JobStatus::Generated.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_code_chunk_serialization() {
        let event = StreamEvent::chunk("j1", "const x = 1;");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"code-chunk\""));
        assert!(json.contains("\"job_id\":\"j1\""));
        assert!(json.contains("\"code\":\"const x = 1;\""));
    }

    #[test]
    fn test_status_event_serialization() {
        let event = StreamEvent::status("j1", JobStatus::Generating, "generating code");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"status\":\"generating\""));
        assert!(json.contains("\"message\":\"generating code\""));
    }

    #[test]
    fn test_complete_event_omits_empty_error() {
        let event = StreamEvent::complete("j1", "done()");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"complete\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_event_round_trip_deserialization() {
        let event = StreamEvent::update("j2", "abcd");
        let json = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, "j2");
        match back.payload {
            EventPayload::CodeUpdate { code } => assert_eq!(code, "abcd"),
            other => panic!("Expected CodeUpdate, got {:?}", other),
        }
    }

    #[test]
    fn test_is_terminal() {
        assert!(StreamEvent::complete("j", "c").is_terminal());
        assert!(StreamEvent::error("j", "boom").is_terminal());
        assert!(!StreamEvent::chunk("j", "c").is_terminal());
        assert!(!StreamEvent::status("j", JobStatus::Generating, "m").is_terminal());
    }

    #[test]
    fn test_metadata_defaults_on_deserialize() {
        let meta: JobMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(meta.retry_count, 0);
        assert!(!meta.auto_fix_applied);
        assert!(meta.trace_id.is_none());
    }
}
