//! Audit event types.
//!
//! Events are appended to `audit.jsonl`, one JSON object per line:
//!
//! ```json
//! {"ts":"2026-03-01T10:15:00.123+01:00","event":"exposure_started","id":"port_xyz_ab12cd","type":"port"}
//! ```

use serde::{Deserialize, Serialize};

/// The recognized audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A session reached `running`.
    ExposureStarted,
    /// A session was stopped by a client or quota.
    ExposureStopped,
    /// A session expired via its TTL.
    ExposureExpired,
    /// The on-disk policy was updated.
    PolicyUpdated,
    /// Garbage collection ran.
    GcRun,
    /// The audit log was exported.
    AuditExported,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// ISO-8601 timestamp with millisecond precision and local offset.
    pub ts: String,
    /// Event kind.
    pub event: AuditKind,
    /// Session id, when the event concerns one session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Exposure type (`port` / `files`), when applicable.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Free-form event details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    /// A bare event with no session attribution.
    pub fn new(ts: String, event: AuditKind) -> Self {
        Self {
            ts,
            event,
            id: None,
            kind: None,
            details: None,
        }
    }

    /// Attach a session id and exposure type.
    pub fn for_session(mut self, id: &str, kind: &str) -> Self {
        self.id = Some(id.to_string());
        self.kind = Some(kind.to_string());
        self
    }

    /// Attach details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = AuditEvent::new("2026-03-01T10:15:00.123+01:00".into(), AuditKind::ExposureStarted)
            .for_session("port_abc_112233", "port")
            .with_details(serde_json::json!({"port": 8080}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"exposure_started\""));
        assert!(json.contains("\"type\":\"port\""));
        assert!(json.contains("\"port\":8080"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = AuditEvent::new("2026-03-01T10:15:00.123+01:00".into(), AuditKind::GcRun);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("\"type\""));
        assert!(!json.contains("\"details\""));
    }
}
