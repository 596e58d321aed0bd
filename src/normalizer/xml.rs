//! Rendered Windows Event Log XML → flat `RawEvent`.

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed event xml: {0}")]
    Xml(String),
    #[error("empty event record")]
    Empty,
}

/// A provider event as rendered by the OS, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub provider: String,
    pub event_id: u32,
    pub level: u8,
    pub task: u32,
    pub opcode: u32,
    pub keywords: String,
    pub time_created: Option<DateTime<Utc>>,
    pub record_id: u64,
    pub channel: String,
    pub computer: String,
    pub process_id: u32,
    pub thread_id: u32,
    pub user_sid: String,
    /// `EventData`/`UserData` name → value.
    pub data: BTreeMap<String, String>,
    /// `RenderingInfo/Message`, when the renderer included it.
    pub message: String,
    pub raw_xml: String,
}

impl RawEvent {
    pub fn is_empty(&self) -> bool {
        self.event_id == 0 && self.provider.is_empty() && self.data.is_empty()
    }
}

fn local(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == key.as_bytes() {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Parse `2024-05-01T10:00:00.1234567Z` style timestamps. Unparseable input yields `None`.
pub fn parse_system_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

struct Builder {
    raw: RawEvent,
    path: Vec<String>,
    data_name: Option<String>,
    unnamed: usize,
}

impl Builder {
    fn open(&mut self, e: &BytesStart<'_>) {
        let name = local(e.local_name().as_ref());
        match name.as_str() {
            "Provider" => {
                if let Some(v) = attr(e, "Name") {
                    self.raw.provider = v;
                }
            }
            "TimeCreated" => {
                self.raw.time_created = attr(e, "SystemTime").and_then(|s| parse_system_time(&s));
            }
            "Execution" => {
                self.raw.process_id = attr(e, "ProcessID").and_then(|v| v.parse().ok()).unwrap_or(0);
                self.raw.thread_id = attr(e, "ThreadID").and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "Security" => {
                if let Some(v) = attr(e, "UserID") {
                    self.raw.user_sid = v;
                }
            }
            "Data" => {
                let key = attr(e, "Name").unwrap_or_else(|| {
                    self.unnamed += 1;
                    format!("param{}", self.unnamed)
                });
                self.data_name = Some(key);
            }
            _ => {}
        }
    }

    fn empty(&mut self, e: &BytesStart<'_>) {
        self.open(e);
        // <Data Name="X"/> is a present-but-empty value
        if let Some(key) = self.data_name.take() {
            self.raw.data.insert(key, String::new());
        }
    }

    fn text(&mut self, text: String) {
        let Some(top) = self.path.last() else {
            return;
        };
        let in_system = self.path.iter().any(|p| p == "System");
        if in_system {
            match top.as_str() {
                "EventID" => self.raw.event_id = text.trim().parse().unwrap_or(0),
                "Level" => self.raw.level = text.trim().parse().unwrap_or(0),
                "Task" => self.raw.task = text.trim().parse().unwrap_or(0),
                "Opcode" => self.raw.opcode = text.trim().parse().unwrap_or(0),
                "Keywords" => self.raw.keywords = text,
                "EventRecordID" => self.raw.record_id = text.trim().parse().unwrap_or(0),
                "Channel" => self.raw.channel = text,
                "Computer" => self.raw.computer = text,
                _ => {}
            }
            return;
        }
        if top == "Data" {
            if let Some(key) = self.data_name.take() {
                self.raw.data.insert(key, text);
            }
            return;
        }
        if top == "Message" && self.path.iter().any(|p| p == "RenderingInfo") {
            self.raw.message = text;
            return;
        }
        // <UserData><Wrapper><Field>value</Field></Wrapper></UserData>
        if self.path.iter().any(|p| p == "UserData") {
            self.raw.data.insert(top.clone(), text);
        }
    }

    fn close(&mut self) {
        if let Some(top) = self.path.pop() {
            if top == "Data" {
                if let Some(key) = self.data_name.take() {
                    self.raw.data.insert(key, String::new());
                }
            }
        }
    }
}

/// Parse one rendered event. The original XML is kept in `raw_xml`.
pub fn parse_event_xml(xml: &str) -> Result<RawEvent, ParseError> {
    if xml.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut b = Builder {
        raw: RawEvent {
            raw_xml: xml.to_string(),
            ..Default::default()
        },
        path: Vec::new(),
        data_name: None,
        unnamed: 0,
    };

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                b.open(&e);
                b.path.push(local(e.local_name().as_ref()));
            }
            Ok(XmlEvent::Empty(e)) => b.empty(&e),
            Ok(XmlEvent::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ParseError::Xml(e.to_string()))?
                    .into_owned();
                b.text(text);
            }
            Ok(XmlEvent::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                b.text(text);
            }
            Ok(XmlEvent::End(_)) => b.close(),
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ParseError::Xml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if b.raw.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(b.raw)
}
