//! Canonical normalized security event and the batch envelope the sender ships.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tolerated drift between the source clock and the agent clock.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 300;

/// Severity ordinal, 1 (informational) to 5 (critical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Severity {
    Info = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    Critical = 5,
}

impl Severity {
    /// Map a Windows event `Level` (1 critical .. 5 verbose, 0 log-always).
    pub fn from_windows_level(level: u8) -> Self {
        match level {
            1 => Severity::Critical,
            2 => Severity::High,
            3 => Severity::Medium,
            _ => Severity::Info,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl From<Severity> for u8 {
    fn from(s: Severity) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Severity::Info),
            2 => Ok(Severity::Low),
            3 => Ok(Severity::Medium),
            4 => Ok(Severity::High),
            5 => Ok(Severity::Critical),
            other => Err(format!("severity out of range: {}", other)),
        }
    }
}

/// Unified event produced by the normalizer.
///
/// Semantic fields are filled only when the event code carries them; everything
/// the dispatch does not map lands in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    // identity
    pub agent_id: String,
    pub computer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    // provenance
    pub source_type: String,
    pub event_code: u32,
    pub channel: String,
    pub provider: String,
    pub record_id: u64,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_data: String,

    // timing
    pub event_time: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,

    // accounts
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject_domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject_logon_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_logon_id: String,

    // process
    #[serde(default, skip_serializing_if = "is_zero")]
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub process_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_line: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parent_process_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_process_name: String,

    // network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_ip: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub source_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_ip: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub destination_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,

    // file / registry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry_path: String,

    // services
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account: String,

    // logon
    #[serde(default, skip_serializing_if = "is_zero")]
    pub logon_type: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
    pub message: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

impl Event {
    /// True when the source timestamp lies further in the future than the skew tolerance.
    pub fn has_clock_anomaly(&self) -> bool {
        self.event_time - self.collected_at > Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS)
    }

    /// Fill in the agent id if the event was created before registration finished.
    pub fn stamp_agent_id(&mut self, agent_id: &str) {
        if self.agent_id.is_empty() && !agent_id.is_empty() {
            self.agent_id = agent_id.to_string();
        }
    }
}

/// One outbound `send event batch` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub agent_id: String,
    pub sent_at: DateTime<Utc>,
    pub events: Vec<Event>,
}

impl EventBatch {
    pub fn new(agent_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            sent_at: Utc::now(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_serializes_as_ordinal() {
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "4");
        let back: Severity = serde_json::from_str("2").unwrap();
        assert_eq!(back, Severity::Low);
        assert!(serde_json::from_str::<Severity>("9").is_err());
    }

    #[test]
    fn windows_levels_map_to_severity() {
        assert_eq!(Severity::from_windows_level(1), Severity::Critical);
        assert_eq!(Severity::from_windows_level(2), Severity::High);
        assert_eq!(Severity::from_windows_level(3), Severity::Medium);
        assert_eq!(Severity::from_windows_level(4), Severity::Info);
        assert_eq!(Severity::from_windows_level(0), Severity::Info);
    }

    #[test]
    fn clock_anomaly_only_beyond_tolerance() {
        let now = Utc::now();
        let mut ev = Event {
            event_time: now + Duration::seconds(10),
            collected_at: now,
            ..Default::default()
        };
        assert!(!ev.has_clock_anomaly());
        ev.event_time = now + Duration::seconds(CLOCK_SKEW_TOLERANCE_SECS + 1);
        assert!(ev.has_clock_anomaly());
        // retroactive events are fine
        ev.event_time = now - Duration::days(3);
        assert!(!ev.has_clock_anomaly());
    }

    #[test]
    fn stamp_does_not_overwrite() {
        let mut ev = Event::default();
        ev.stamp_agent_id("");
        assert!(ev.agent_id.is_empty());
        ev.stamp_agent_id("a-1");
        ev.stamp_agent_id("a-2");
        assert_eq!(ev.agent_id, "a-1");
    }
}
