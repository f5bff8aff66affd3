//! Sensor payload encoding.
//!
//! Payloads are compact JSON objects written into a fixed 250 byte buffer.
//! Every write is checked against the remaining capacity, so an oversized
//! reading fails with [`AgentError::PayloadOverflow`] instead of being cut.

use chrono::{DateTime, Utc};
use core::fmt::Write;
use rand::Rng;

use crate::error::{AgentError, AgentResult};
use crate::simulate;
use crate::types::SensorReading;

pub const MAX_PAYLOAD_LEN: usize = 250;

/// Constant `origin` tag.
pub const ORIGIN: &str = "physical Device";

/// An encoded payload, never longer than [`MAX_PAYLOAD_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(heapless::String<MAX_PAYLOAD_LEN>);

impl Payload {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl core::fmt::Display for Payload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Writer {
    buf: heapless::String<MAX_PAYLOAD_LEN>,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: heapless::String::new(),
        }
    }

    fn raw(&mut self, s: &str) -> AgentResult<()> {
        self.buf.push_str(s).map_err(|_| overflow())
    }

    fn fmt(&mut self, args: core::fmt::Arguments<'_>) -> AgentResult<()> {
        self.buf.write_fmt(args).map_err(|_| overflow())
    }

    fn string_field(&mut self, key: &str, value: &str) -> AgentResult<()> {
        // serde_json handles quoting and escaping of the value.
        let quoted = serde_json::to_string(value).map_err(|e| AgentError::invalid(e.to_string()))?;
        self.fmt(format_args!("\"{key}\":{quoted}"))
    }
}

fn overflow() -> AgentError {
    AgentError::PayloadOverflow {
        limit: MAX_PAYLOAD_LEN,
    }
}

/// Encodes `reading` as observed at `now`, with a fresh correlation token.
pub fn encode<R: Rng + ?Sized>(
    reading: &SensorReading,
    now: DateTime<Utc>,
    rng: &mut R,
) -> AgentResult<Payload> {
    let token = simulate::correlation_token(rng);
    encode_with_token(reading, now, &token)
}

pub fn encode_with_token(
    reading: &SensorReading,
    now: DateTime<Utc>,
    token: &str,
) -> AgentResult<Payload> {
    let mut w = Writer::new();
    w.fmt(format_args!("{{\"timestamp\":{},", now.timestamp()))?;
    w.string_field("sensorName", &reading.name)?;
    w.raw(",")?;
    w.string_field("sensorType", reading.kind.as_str())?;
    w.raw(",")?;
    w.string_field("origin", ORIGIN)?;
    w.raw(",")?;
    w.string_field("sensorID", &reading.id)?;
    w.fmt(format_args!(",\"value\":{},", format_value(reading.value)))?;
    w.string_field("ID", token)?;
    w.raw("}")?;
    Ok(Payload(w.buf))
}

/// Three decimals, truncated toward zero so the text never reaches the
/// exclusive upper bound of the sensor range.
pub fn format_value(value: f32) -> String {
    let millis = (f64::from(value) * 1000.0).trunc();
    format!("{:.3}", millis / 1000.0)
}
