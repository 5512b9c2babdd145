//! Core domain types for guardiantrack
//!
//! These types describe what flows through the upload pipeline.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **CaptureEvent** | A single observed fact (GPS fix, call record, SMS record) ready for upload |
//! | **Payload** | Ordered field name to scalar mapping carried by an event |
//! | **QueuedUpload** | A persisted, not-yet-delivered projection of a capture event |
//! | **Drain** | Attempting redelivery of every currently queued upload |
//!
//! A capture event only becomes a [`QueuedUpload`] when its immediate delivery
//! fails. Queued uploads are never edited: they are deleted once delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================
// Upload kind
// ============================================

/// What a capture event describes.
///
/// The set is open: unknown kinds round-trip through [`UploadKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UploadKind {
    /// A GPS fix
    Location,
    /// A call-log entry
    CallLog,
    /// An SMS entry
    SmsLog,
    /// Any other kind reported by a capture source
    Other(String),
}

impl UploadKind {
    pub fn as_str(&self) -> &str {
        match self {
            UploadKind::Location => "location",
            UploadKind::CallLog => "call_log",
            UploadKind::SmsLog => "sms_log",
            UploadKind::Other(kind) => kind,
        }
    }

    /// Whether this kind is stored and sent under the name it parses back from.
    ///
    /// False for an empty or padded `Other` name, and for an `Other` that
    /// spells one of the known kinds.
    pub fn is_canonical(&self) -> bool {
        self.as_str()
            .parse::<UploadKind>()
            .is_ok_and(|parsed| parsed == *self)
    }
}

impl std::fmt::Display for UploadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for UploadKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("upload kind must not be empty".to_string()),
            "location" => Ok(UploadKind::Location),
            "call_log" => Ok(UploadKind::CallLog),
            "sms_log" => Ok(UploadKind::SmsLog),
            other => Ok(UploadKind::Other(other.to_string())),
        }
    }
}

impl TryFrom<String> for UploadKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UploadKind> for String {
    fn from(kind: UploadKind) -> Self {
        kind.as_str().to_string()
    }
}

// ============================================
// Payload
// ============================================

/// A scalar payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(i) => Value::from(i),
            // Non-finite floats have no JSON form.
            Scalar::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Text(s) => Value::String(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Ordered mapping from field name to scalar value.
///
/// Serialized as a JSON object so stored rows stay self-describing; field
/// order is insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field, keeping its original position on replace
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(name.into(), value.into().into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Field names in insertion order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Build a payload from a JSON value, rejecting anything but a flat object
    /// of scalars.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::Payload("payload must be a JSON object".to_string()));
        };

        if let Some((name, _)) = map
            .iter()
            .find(|(_, v)| matches!(v, Value::Array(_) | Value::Object(_)))
        {
            return Err(Error::Payload(format!(
                "field '{}' is not a scalar value",
                name
            )));
        }

        Ok(Self(map))
    }

    /// Decode the stored text form
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Payload(format!("invalid payload JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Encode to the stored text form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(Error::from)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Payload::from_value(value).map_err(serde::de::Error::custom)
    }
}

// ============================================
// Capture events
// ============================================

/// A freshly captured fact, consumed immediately by the upload coordinator.
///
/// Never persisted as-is; only its failed-delivery projection is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Idempotency key, sent with every delivery attempt of this event
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub kind: UploadKind,
    pub fields: Payload,
}

impl CaptureEvent {
    pub fn new(kind: UploadKind, fields: Payload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            fields,
        }
    }
}

// ============================================
// Queued uploads
// ============================================

/// A row of the durable queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpload {
    /// Row identity, assigned at persist time, strictly increasing
    pub id: i64,
    /// Idempotency key of the originating capture event
    pub event_id: Uuid,
    pub kind: UploadKind,
    /// Stored payload text (JSON object)
    pub payload: String,
    pub queued_at: DateTime<Utc>,
}

impl QueuedUpload {
    /// Decode the stored payload
    pub fn decode_payload(&self) -> Result<Payload> {
        Payload::from_json(&self.payload)
    }
}

/// A stored row whose columns could not be decoded into a [`QueuedUpload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableUpload {
    pub id: i64,
    pub reason: String,
}

/// One row of the queue as read from storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingRow {
    Ready(QueuedUpload),
    Unreadable(UnreadableUpload),
}

impl PendingRow {
    pub fn id(&self) -> i64 {
        match self {
            PendingRow::Ready(upload) => upload.id,
            PendingRow::Unreadable(row) => row.id,
        }
    }
}

// ============================================
// Delivery outcome
// ============================================

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// A connect, write or read deadline elapsed
    Timeout(String),
    /// The endpoint could not be reached
    Network(String),
    /// The endpoint answered with a non-success status
    Status { code: u16, body: String },
    /// The request could not be built
    Encode(String),
    /// The attempt was abandoned because the worker is shutting down
    Cancelled,
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailure::Timeout(msg) => write!(f, "timeout: {}", msg),
            DeliveryFailure::Network(msg) => write!(f, "network error: {}", msg),
            DeliveryFailure::Status { code, body } => write!(f, "HTTP {}: {}", code, body),
            DeliveryFailure::Encode(msg) => write!(f, "encode error: {}", msg),
            DeliveryFailure::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure(DeliveryFailure),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}
