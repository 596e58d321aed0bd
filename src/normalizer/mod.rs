//! Provider-specific raw events → canonical [`Event`].
//!
//! - `xml`: rendered event XML into a flat [`RawEvent`]
//! - `security`: Windows Security / System / PowerShell event codes
//! - `sysmon`: Sysmon operational event codes
//! - `hash`: `Hashes` field helpers
//!
//! Normalization never performs I/O and never fails on a bad sub-field: the
//! field is left at its zero value.

mod hash;
mod security;
mod sysmon;
mod xml;

pub use hash::extract_sha256;
pub use xml::{parse_event_xml, parse_system_time, ParseError, RawEvent};

use crate::event::{Event, Severity};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const SYSMON_PROVIDER: &str = "Microsoft-Windows-Sysmon";

/// Stateless converter; one instance is shared by every channel loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one raw record. `collected_at` is supplied by the caller so the
    /// result depends only on the inputs.
    pub fn normalize(
        &self,
        raw: &RawEvent,
        channel: &str,
        collected_at: DateTime<Utc>,
    ) -> Option<Event> {
        if raw.is_empty() {
            return None;
        }
        let channel = if channel.is_empty() {
            raw.channel.clone()
        } else {
            channel.to_string()
        };
        let sysmon = is_sysmon(&raw.provider, &channel);

        let mut ev = Event {
            computer: raw.computer.clone(),
            source_type: source_type(&raw.provider, &channel),
            event_code: raw.event_id,
            channel,
            provider: raw.provider.clone(),
            record_id: raw.record_id,
            severity: Severity::from_windows_level(raw.level),
            raw_data: raw.raw_xml.clone(),
            event_time: raw.time_created.unwrap_or(collected_at),
            collected_at,
            ..Default::default()
        };

        let mut fields = Fields::new(&raw.data);
        let enriched = if sysmon {
            sysmon::enrich(&mut ev, &mut fields)
        } else {
            security::enrich(&mut ev, &mut fields)
        };

        if !enriched {
            ev.message = if raw.message.trim().is_empty() {
                format!("Event {} from {}", raw.event_id, raw.provider)
            } else {
                raw.message.trim().to_string()
            };
        }
        ev.extra.extend(fields.into_rest());
        ev.extra.retain(|_, v| !v.trim().is_empty());
        Some(ev)
    }

    /// Parse rendered XML and normalize it in one step.
    pub fn normalize_xml(
        &self,
        xml: &str,
        channel: &str,
        collected_at: DateTime<Utc>,
    ) -> Result<Option<Event>, ParseError> {
        let raw = parse_event_xml(xml)?;
        Ok(self.normalize(&raw, channel, collected_at))
    }
}

pub fn is_sysmon(provider: &str, channel: &str) -> bool {
    provider.contains("Sysmon") || channel.contains("Sysmon")
}

pub fn source_type(provider: &str, channel: &str) -> String {
    if is_sysmon(provider, channel) {
        return "Sysmon".to_string();
    }
    match channel {
        "Security" => "Windows Security".to_string(),
        "System" => "Windows System".to_string(),
        "Application" => "Windows Application".to_string(),
        c if c.contains("PowerShell") => "PowerShell".to_string(),
        c => c.to_string(),
    }
}

/// Event data with consumed-key tracking; whatever is not taken ends up in `extra`.
pub(crate) struct Fields {
    rest: BTreeMap<String, String>,
}

impl Fields {
    fn new(data: &BTreeMap<String, String>) -> Self {
        Self { rest: data.clone() }
    }

    /// Take a string field; the Windows "-" placeholder counts as empty.
    pub(crate) fn take(&mut self, key: &str) -> String {
        match self.rest.remove(key) {
            Some(v) => clean(v),
            None => String::new(),
        }
    }

    /// First non-empty of several candidate keys. All candidates are consumed.
    pub(crate) fn take_any(&mut self, keys: &[&str]) -> String {
        let mut found = String::new();
        for key in keys {
            let v = self.take(key);
            if found.is_empty() && !v.is_empty() {
                found = v;
            }
        }
        found
    }

    /// Decimal or `0x` hex; unparseable input is 0.
    pub(crate) fn take_u32(&mut self, key: &str) -> u32 {
        parse_u32(&self.take(key))
    }

    pub(crate) fn take_u16(&mut self, key: &str) -> u16 {
        self.take(key).parse().unwrap_or(0)
    }

    /// Read without consuming.
    pub(crate) fn peek(&self, key: &str) -> &str {
        self.rest.get(key).map(String::as_str).unwrap_or("")
    }

    fn into_rest(self) -> BTreeMap<String, String> {
        self.rest
    }
}

fn clean(v: String) -> String {
    let t = v.trim();
    if t == "-" {
        String::new()
    } else if t.len() == v.len() {
        v
    } else {
        t.to_string()
    }
}

pub(crate) fn parse_u32(s: &str) -> u32 {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        s.parse().unwrap_or(0)
    }
}

/// `DOMAIN\user` → (`DOMAIN`, `user`); a bare name has no domain.
pub(crate) fn split_account(account: &str) -> (String, String) {
    match account.split_once('\\') {
        Some((domain, user)) => (domain.to_string(), user.to_string()),
        None => (String::new(), account.to_string()),
    }
}

/// `CORP\alice`, or just `alice` when no domain is known.
pub(crate) fn qualified(domain: &str, user: &str) -> String {
    if domain.is_empty() {
        user.to_string()
    } else {
        format!("{}\\{}", domain, user)
    }
}

/// Text for message templates; empty values render as "unknown".
pub(crate) fn or_unknown(s: &str) -> &str {
    if s.is_empty() {
        "unknown"
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(provider: &str, id: u32, data: &[(&str, &str)]) -> RawEvent {
        RawEvent {
            provider: provider.to_string(),
            event_id: id,
            level: 4,
            record_id: 7,
            channel: "Security".to_string(),
            computer: "WS01".to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_record_is_skipped() {
        let n = Normalizer::new();
        assert!(n.normalize(&RawEvent::default(), "Security", Utc::now()).is_none());
    }

    #[test]
    fn unknown_code_uses_generic_message() {
        let n = Normalizer::new();
        let ev = n
            .normalize(&raw("Some-Provider", 31337, &[("Foo", "bar")]), "Application", Utc::now())
            .unwrap();
        assert_eq!(ev.message, "Event 31337 from Some-Provider");
        assert_eq!(ev.extra.get("Foo").map(String::as_str), Some("bar"));
        assert_eq!(ev.source_type, "Windows Application");
    }

    #[test]
    fn unknown_code_prefers_rendered_message() {
        let n = Normalizer::new();
        let mut r = raw("Some-Provider", 31337, &[]);
        r.message = "  Something happened.  ".to_string();
        let ev = n.normalize(&r, "", Utc::now()).unwrap();
        assert_eq!(ev.message, "Something happened.");
        assert_eq!(ev.channel, "Security");
    }

    #[test]
    fn missing_time_falls_back_to_collection_time() {
        let n = Normalizer::new();
        let now = Utc::now();
        let ev = n.normalize(&raw("P", 1, &[]), "Application", now).unwrap();
        assert_eq!(ev.event_time, now);
        assert_eq!(ev.collected_at, now);
    }

    #[test]
    fn normalization_is_deterministic() {
        let n = Normalizer::new();
        let r = raw(
            "Microsoft-Windows-Security-Auditing",
            4624,
            &[("TargetUserName", "bob"), ("LogonType", "10"), ("IpAddress", "10.1.1.1")],
        );
        let a = n.normalize(&r, "Security", Utc::now()).unwrap();
        let mut b = n.normalize(&r, "Security", Utc::now()).unwrap();
        b.collected_at = a.collected_at;
        b.event_time = a.event_time;
        assert_eq!(a, b);
    }

    #[test]
    fn source_types() {
        assert_eq!(source_type(SYSMON_PROVIDER, "Microsoft-Windows-Sysmon/Operational"), "Sysmon");
        assert_eq!(source_type("x", "Security"), "Windows Security");
        assert_eq!(source_type("x", "System"), "Windows System");
        assert_eq!(source_type("x", "Microsoft-Windows-PowerShell/Operational"), "PowerShell");
        assert_eq!(source_type("x", "Custom/Log"), "Custom/Log");
    }

    #[test]
    fn numeric_helpers() {
        assert_eq!(parse_u32("0x1a4"), 420);
        assert_eq!(parse_u32("420"), 420);
        assert_eq!(parse_u32("nope"), 0);
        assert_eq!(split_account("CORP\\alice"), ("CORP".to_string(), "alice".to_string()));
        assert_eq!(split_account("alice"), (String::new(), "alice".to_string()));
    }
}
