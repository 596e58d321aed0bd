//! Tamper alerts and the sink that forwards them to the server as events.

use crate::event::{Event, Severity};
use crate::queue::QueueProducer;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, warn};

pub const ALERT_SOURCE: &str = "Agent Self-Protection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    FileModified,
    FileDeleted,
    ServiceStopped,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::FileModified => "file_modified",
            AlertKind::FileDeleted => "file_deleted",
            AlertKind::ServiceStopped => "service_stopped",
        }
    }

    pub fn event_code(self) -> u32 {
        match self {
            AlertKind::FileModified => 9001,
            AlertKind::FileDeleted => 9002,
            AlertKind::ServiceStopped => 9003,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TamperAlert {
    pub kind: AlertKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

impl TamperAlert {
    pub fn to_event(&self) -> Event {
        let mut ev = Event {
            source_type: ALERT_SOURCE.to_string(),
            provider: ALERT_SOURCE.to_string(),
            channel: ALERT_SOURCE.to_string(),
            event_code: self.kind.event_code(),
            severity: Severity::Critical,
            event_time: self.detected_at,
            collected_at: self.detected_at,
            message: self.detail.clone(),
            ..Default::default()
        };
        ev.extra.insert("alert_type".into(), self.kind.as_str().into());
        if let Some(p) = &self.path {
            ev.file_path = p.to_string_lossy().into_owned();
        }
        if let Some(s) = &self.service {
            ev.service_name = s.clone();
        }
        if let Some(h) = &self.current_hash {
            ev.file_hash = h.clone();
        }
        if let Some(h) = &self.previous_hash {
            ev.extra.insert("previous_hash".into(), h.clone());
        }
        ev
    }
}

/// Receives alerts; the supervisor knows nothing about delivery.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: TamperAlert);
}

/// Delivers alerts through the regular event queue.
pub struct QueueAlertSink {
    producer: QueueProducer,
    state: SharedState,
    hostname: String,
}

impl QueueAlertSink {
    pub fn new(producer: QueueProducer, state: SharedState, hostname: impl Into<String>) -> Self {
        Self {
            producer,
            state,
            hostname: hostname.into(),
        }
    }
}

impl AlertSink for QueueAlertSink {
    fn raise(&self, alert: TamperAlert) {
        warn!(alert = alert.kind.as_str(), detail = %alert.detail, "tamper alert");
        let mut ev = alert.to_event();
        ev.agent_id = self.state.agent_id();
        ev.computer = self.hostname.clone();
        if let Err(e) = self.producer.try_enqueue(ev) {
            self.state.record_dropped(1);
            error!(alert = alert.kind.as_str(), error = %e, "tamper alert could not be queued");
        } else {
            self.state.record_collected(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::state::AgentIdentity;

    fn alert(kind: AlertKind) -> TamperAlert {
        TamperAlert {
            kind,
            path: Some(PathBuf::from("/opt/agent/agent.bin")),
            service: None,
            previous_hash: Some("aa".into()),
            current_hash: Some("bb".into()),
            detail: "changed".into(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn alert_becomes_critical_event() {
        let ev = alert(AlertKind::FileModified).to_event();
        assert_eq!(ev.event_code, 9001);
        assert_eq!(ev.severity, Severity::Critical);
        assert_eq!(ev.source_type, ALERT_SOURCE);
        assert_eq!(ev.file_hash, "bb");
        assert_eq!(ev.extra["previous_hash"], "aa");
        assert_eq!(ev.extra["alert_type"], "file_modified");
    }

    #[test]
    fn queue_sink_enqueues_with_identity() {
        let (producer, mut consumer) = EventQueue::new(1);
        let state = SharedState::new(AgentIdentity::new("ws01"));
        state.set_agent_id("a-3");
        let sink = QueueAlertSink::new(producer, state.clone(), "ws01");

        sink.raise(alert(AlertKind::FileDeleted));
        sink.raise(alert(AlertKind::ServiceStopped));

        let ev = consumer.try_dequeue().unwrap();
        assert_eq!(ev.event_code, 9002);
        assert_eq!(ev.agent_id, "a-3");
        assert_eq!(ev.computer, "ws01");
        assert_eq!(state.snapshot().events_dropped, 1);
    }
}
