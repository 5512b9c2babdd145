//! Capture records and sources
//!
//! Capture sources (GPS, call log, SMS log) live outside this crate. This
//! module defines the records they hand over, how each record maps onto an
//! upload payload, and a line-oriented source for feeding events in from a
//! pipe.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::db::UploadQueue;
use crate::error::Result;
use crate::types::{CaptureEvent, Payload, UploadKind};
use crate::upload::CoordinatorHandle;

/// Wire format for capture timestamps, e.g. `6/01/2025 08:00:00`
pub const TIMESTAMP_FORMAT: &str = "%-m/%d/%Y %H:%M:%S";

/// Format epoch milliseconds in local time
pub fn format_timestamp(timestamp_ms: i64) -> String {
    format_timestamp_with(timestamp_ms, &Local)
}

/// Format epoch milliseconds in the given time zone.
///
/// Out-of-range values fall back to the raw millisecond count.
pub fn format_timestamp_with<Tz>(timestamp_ms: i64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match DateTime::from_timestamp_millis(timestamp_ms) {
        Some(utc) => utc.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string(),
        None => timestamp_ms.to_string(),
    }
}

/// A record produced by a capture source
pub trait CaptureRecord {
    fn kind() -> UploadKind;

    /// When the record was observed, in epoch milliseconds
    fn timestamp_ms(&self) -> i64;

    /// Upload fields, with timestamps rendered in `tz`
    fn payload_in<Tz>(&self, tz: &Tz) -> Payload
    where
        Tz: TimeZone,
        Tz::Offset: Display;

    fn to_event(&self) -> CaptureEvent {
        CaptureEvent::new(Self::kind(), self.payload_in(&Local))
    }
}

/// A single GPS fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl CaptureRecord for LocationFix {
    fn kind() -> UploadKind {
        UploadKind::Location
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    fn payload_in<Tz>(&self, tz: &Tz) -> Payload
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Payload::new()
            .with("timestamp", format_timestamp_with(self.timestamp_ms, tz))
            .with("latitude", self.latitude)
            .with("longitude", self.longitude)
    }
}

/// Direction of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Incoming,
    Outgoing,
    Missed,
    #[serde(other)]
    Unknown,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Incoming => "INCOMING",
            CallType::Outgoing => "OUTGOING",
            CallType::Missed => "MISSED",
            CallType::Unknown => "UNKNOWN",
        }
    }
}

/// One call-log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub number: String,
    pub call_type: CallType,
    pub timestamp_ms: i64,
    pub duration_secs: u64,
}

impl CaptureRecord for CallLogEntry {
    fn kind() -> UploadKind {
        UploadKind::CallLog
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    fn payload_in<Tz>(&self, tz: &Tz) -> Payload
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Payload::new()
            .with("number", self.number.as_str())
            .with("callType", self.call_type.as_str())
            .with("timestamp", format_timestamp_with(self.timestamp_ms, tz))
            .with("duration", self.duration_secs.to_string())
    }
}

/// Direction of a text message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SmsType {
    Received,
    Sent,
    #[serde(other)]
    Unknown,
}

impl SmsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsType::Received => "RECEIVED",
            SmsType::Sent => "SENT",
            SmsType::Unknown => "UNKNOWN",
        }
    }
}

/// One SMS-log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsLogEntry {
    /// Counterpart address; empty when the platform reports none
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub body: String,
    pub sms_type: SmsType,
    pub timestamp_ms: i64,
}

impl CaptureRecord for SmsLogEntry {
    fn kind() -> UploadKind {
        UploadKind::SmsLog
    }

    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    fn payload_in<Tz>(&self, tz: &Tz) -> Payload
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Payload::new()
            .with("number", self.address.as_str())
            .with("smsType", self.sms_type.as_str())
            .with("timestamp", format_timestamp_with(self.timestamp_ms, tz))
            .with("message", self.body.as_str())
    }
}

/// Newest `limit` records, newest first
pub fn newest<T: CaptureRecord>(mut records: Vec<T>, limit: usize) -> Vec<T> {
    records.sort_by_key(|r| std::cmp::Reverse(r.timestamp_ms()));
    records.truncate(limit);
    records
}

/// Pull-based stream of capture events
#[async_trait]
pub trait CaptureSource: Send {
    /// Next event, or `None` once the source is exhausted
    async fn next_event(&mut self) -> Option<CaptureEvent>;
}

/// Reads one JSON-encoded [`CaptureEvent`] per line.
///
/// Blank lines are ignored; lines that do not decode are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    skipped: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            skipped: 0,
        }
    }

    /// Lines rejected so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> CaptureSource for JsonLinesSource<R> {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read capture input");
                    return None;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<CaptureEvent>(line) {
                Ok(event) => return Some(event),
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(error = %e, "Skipping malformed capture line");
                }
            }
        }
    }
}

/// Submit every event from `source` until it is exhausted.
///
/// Returns the number of events handed to the coordinator.
pub async fn forward_events<S, Q>(source: &mut S, handle: &CoordinatorHandle<Q>) -> Result<usize>
where
    S: CaptureSource + ?Sized,
    Q: UploadQueue,
{
    let mut forwarded = 0;
    while let Some(event) = source.next_event().await {
        tracing::debug!(kind = %event.kind, event_id = %event.event_id, "Captured event");
        handle.submit(event)?;
        forwarded += 1;
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testing::ScriptedTransport;
    use crate::upload::{DrainReason, UploadCoordinator};
    use chrono::{FixedOffset, Utc};
    use std::sync::Arc;
    use tokio::io::BufReader;

    // 2023-11-14T22:13:20Z
    const TS: i64 = 1_700_000_000_000;

    #[test]
    fn test_format_timestamp_without_month_padding() {
        assert_eq!(format_timestamp_with(TS, &Utc), "11/14/2023 22:13:20");
        assert_eq!(
            format_timestamp_with(1_717_228_800_000, &Utc),
            "6/01/2024 08:00:00"
        );
    }

    #[test]
    fn test_format_timestamp_applies_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(format_timestamp_with(TS, &tz), "11/15/2023 00:13:20");
    }

    #[test]
    fn test_location_payload_fields() {
        let fix = LocationFix {
            timestamp_ms: TS,
            latitude: 37.7749,
            longitude: -122.4194,
        };
        let payload = fix.payload_in(&Utc);

        let names: Vec<&str> = payload.field_names().collect();
        assert_eq!(names, vec!["timestamp", "latitude", "longitude"]);
        assert_eq!(payload.get("latitude"), Some(&serde_json::json!(37.7749)));
        assert_eq!(fix.to_event().kind, UploadKind::Location);
    }

    #[test]
    fn test_call_log_payload_fields() {
        let entry = CallLogEntry {
            number: "+15550100".to_string(),
            call_type: CallType::Missed,
            timestamp_ms: TS,
            duration_secs: 42,
        };
        let payload = entry.payload_in(&Utc);

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "number": "+15550100",
                "callType": "MISSED",
                "timestamp": "11/14/2023 22:13:20",
                "duration": "42"
            })
        );
    }

    #[test]
    fn test_sms_log_payload_fields() {
        let entry: SmsLogEntry = serde_json::from_str(
            r#"{"address": "+15550100", "body": "on my way", "sms_type": "SENT", "timestamp_ms": 1700000000000}"#,
        )
        .unwrap();
        let payload = entry.payload_in(&Utc);

        let names: Vec<&str> = payload.field_names().collect();
        assert_eq!(names, vec!["number", "smsType", "timestamp", "message"]);
        assert_eq!(payload.get("smsType"), Some(&serde_json::json!("SENT")));
        assert_eq!(payload.get("message"), Some(&serde_json::json!("on my way")));
    }

    #[test]
    fn test_unrecognized_types_map_to_unknown() {
        let call: CallType = serde_json::from_str(r#""VOICEMAIL""#).unwrap();
        let sms: SmsType = serde_json::from_str(r#""DRAFT""#).unwrap();
        assert_eq!(call, CallType::Unknown);
        assert_eq!(sms, SmsType::Unknown);
    }

    #[test]
    fn test_newest_keeps_latest_entries() {
        let entries: Vec<CallLogEntry> = (0..15)
            .map(|i| CallLogEntry {
                number: i.to_string(),
                call_type: CallType::Incoming,
                timestamp_ms: TS + i * 1000,
                duration_secs: 0,
            })
            .collect();

        let kept = newest(entries, 10);
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0].number, "14");
        assert_eq!(kept[9].number, "5");
    }

    #[tokio::test]
    async fn test_json_lines_source_skips_bad_lines() {
        let input = concat!(
            r#"{"kind": "location", "fields": {"latitude": 1.0, "longitude": 2.0}}"#,
            "\n\nnot json\n",
            r#"{"kind": "sms_log", "fields": {"nested": {"a": 1}}}"#,
            "\n",
            r#"{"kind": "call_log", "fields": {"number": "1"}}"#,
            "\n"
        );
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));

        let first = source.next_event().await.unwrap();
        assert_eq!(first.kind, UploadKind::Location);
        let second = source.next_event().await.unwrap();
        assert_eq!(second.kind, UploadKind::CallLog);
        assert!(source.next_event().await.is_none());
        assert_eq!(source.skipped(), 2);
    }

    #[tokio::test]
    async fn test_forward_events_submits_everything() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let queue = Arc::new(db);
        let (handle, task) =
            UploadCoordinator::new(ScriptedTransport::failing(), queue.clone()).spawn();

        let input = concat!(
            r#"{"kind": "location", "fields": {"marker": "a"}}"#,
            "\n",
            r#"{"kind": "wifi_scan", "fields": {"marker": "b"}}"#,
            "\n"
        );
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));

        let forwarded = forward_events(&mut source, &handle).await.unwrap();
        assert_eq!(forwarded, 2);

        handle.drain(DrainReason::Explicit).await.unwrap();
        let rows = queue.list_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].kind, UploadKind::Other("wifi_scan".to_string()));

        drop(handle);
        task.await.unwrap();
    }
}
