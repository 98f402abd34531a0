//! Inbound wire envelope and classifier for the telemetry stream.
//!
//! The bridge pushes one JSON object per text frame, tagged by a `type`
//! discriminator (`status`, `msg`, `robot`). This crate turns a raw frame into
//! a typed [`InboundEvent`]. Classification never fails: anything that does not
//! decode becomes [`InboundEvent::Malformed`], and optional numeric fields that do not
//! coerce are carried as absent rather than as sentinel values.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

/// Separator between the text body and the `<sequence>|<send-ms>` trailer.
pub const PAYLOAD_DELIMITER: char = '|';

/// Error returned by [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not a JSON object.
    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The object carries no string `type` discriminator.
    #[error("envelope has no `type` field")]
    MissingType,
    /// The discriminator names an event kind this client does not consume.
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    /// A field the event kind cannot do without is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// A field the event kind cannot do without does not coerce to a number.
    #[error("field `{0}` is not numeric")]
    NotNumeric(&'static str),
}

/// Sequence number and send time recovered from a payload trailer.
///
/// The two always travel together: latency is only computable when both
/// parsed, so a half-parsed trailer is discarded as a whole.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SequenceStamp {
    pub sequence: i64,
    /// Sender clock in milliseconds since the Unix epoch.
    pub sent_at_ms: f64,
}

impl SequenceStamp {
    /// One-way latency against a receive time, clamped at zero.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn latency_ms(&self, received_at_ms: i64) -> u64 {
        (received_at_ms as f64 - self.sent_at_ms).max(0.0).round() as u64
    }
}

/// A `msg` frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DataEvent {
    pub stamp: Option<SequenceStamp>,
    pub received_at_ms: i64,
    /// Declared `size_bytes`, else the payload's UTF-8 byte length (not its
    /// UTF-16 code-unit count).
    pub size_bytes: u64,
    pub payload: String,
}

impl DataEvent {
    #[must_use]
    pub fn sequence(&self) -> Option<i64> {
        self.stamp.map(|s| s.sequence)
    }

    #[must_use]
    pub fn sent_at_ms(&self) -> Option<f64> {
        self.stamp.map(|s| s.sent_at_ms)
    }

    /// Latency for this event, or `None` when the payload had no usable trailer.
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        self.stamp.map(|s| s.latency_ms(self.received_at_ms))
    }
}

/// A `robot` frame: one planar position sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseEvent {
    pub x: f64,
    pub y: f64,
    pub received_at_ms: i64,
}

/// Result of classifying one inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// Bridge status ping. Acknowledged and dropped.
    Status,
    Data(DataEvent),
    Pose(PoseEvent),
    /// The frame did not decode as an envelope this client understands.
    Malformed,
}

/// Classify a frame, reading the wall clock when the envelope has no `recv_ts`.
#[must_use]
pub fn classify(raw: &str) -> InboundEvent {
    classify_with(raw, now_ms)
}

/// Classify a frame with an injected fallback clock.
#[must_use]
pub fn classify_with(raw: &str, clock: impl FnOnce() -> i64) -> InboundEvent {
    decode(raw, clock).unwrap_or(InboundEvent::Malformed)
}

/// Decode a frame, keeping the reason when it is not a usable envelope.
///
/// # Errors
///
/// Returns [`DecodeError`] when the frame is not a JSON object, has no known
/// `type`, or lacks a field its event kind requires.
pub fn decode(raw: &str, clock: impl FnOnce() -> i64) -> Result<InboundEvent, DecodeError> {
    let fields = serde_json::from_str::<Map<String, Value>>(raw)?;
    let kind = match fields.get("type") {
        Some(Value::String(kind)) => kind.as_str(),
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
        None => return Err(DecodeError::MissingType),
    };

    match kind {
        "status" => Ok(InboundEvent::Status),
        "msg" => decode_data(&fields, clock).map(InboundEvent::Data),
        "robot" => decode_pose(&fields, clock).map(InboundEvent::Pose),
        other => Err(DecodeError::UnknownType(other.to_owned())),
    }
}

/// Recover the `<sequence>|<send-ms>` trailer from a payload.
///
/// Needs at least three segments; the last is the send time and the one
/// before it the sequence number.
#[must_use]
pub fn parse_stamp(payload: &str) -> Option<SequenceStamp> {
    let mut segments = payload.rsplit(PAYLOAD_DELIMITER);
    let sent = segments.next()?;
    let sequence = segments.next()?;
    segments.next()?;

    let sent_at_ms = parse_number(sent)?;
    let sequence = parse_sequence(sequence)?;
    Some(SequenceStamp {
        sequence,
        sent_at_ms,
    })
}

/// Milliseconds since the Unix epoch from the local clock.
#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn decode_data(fields: &Map<String, Value>, clock: impl FnOnce() -> i64) -> Result<DataEvent, DecodeError> {
    let payload = fields
        .get("data")
        .and_then(coerce_text)
        .ok_or(DecodeError::MissingField("data"))?;
    let size_bytes = fields
        .get("size_bytes")
        .and_then(coerce_size)
        .unwrap_or(payload.len() as u64);

    Ok(DataEvent {
        stamp: parse_stamp(&payload),
        received_at_ms: received_at_ms(fields, clock),
        size_bytes,
        payload,
    })
}

fn decode_pose(fields: &Map<String, Value>, clock: impl FnOnce() -> i64) -> Result<PoseEvent, DecodeError> {
    let x = coordinate(fields, "x")?;
    let y = coordinate(fields, "y")?;
    Ok(PoseEvent {
        x,
        y,
        received_at_ms: received_at_ms(fields, clock),
    })
}

fn coordinate(fields: &Map<String, Value>, key: &'static str) -> Result<f64, DecodeError> {
    let value = fields.get(key).ok_or(DecodeError::MissingField(key))?;
    coerce_number(value).ok_or(DecodeError::NotNumeric(key))
}

#[allow(clippy::cast_possible_truncation)]
fn received_at_ms(fields: &Map<String, Value>, clock: impl FnOnce() -> i64) -> i64 {
    fields
        .get("recv_ts")
        .and_then(coerce_number)
        .map_or_else(clock, |secs| (secs * 1000.0).floor() as i64)
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => parse_number(text),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn coerce_size(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        coerce_number(value)
            .filter(|n| *n >= 0.0)
            .map(|n| n.floor() as u64)
    })
}

/// Integer sequence, also accepting integral float spellings such as `3.0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::float_cmp)]
fn parse_sequence(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(sequence) = text.parse::<i64>() {
        return Some(sequence);
    }
    parse_number(text)
        .filter(|n| n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64)
        .map(|n| n as i64)
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
