//! Wire and persisted message types.
//!
//! A submitted batch arrives in one of two forms: the compact binary form
//! (one count byte, then count repetitions of length-prefixed deviceId and
//! payload) or the JSON `{"batch":[{"deviceId":...,"payload":...}]}` form.
//! The first byte discriminates: `{` means JSON.
//!
//! Payloads are opaque to the relay. They are carried as arbitrary JSON
//! values end to end and never inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single element of a submitted batch, addressed to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub payload: Value,
}

/// A message as persisted in a recipient's mailbox and streamed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub sender: String,
    #[serde(rename = "encPayload")]
    pub payload: Value,
    #[serde(rename = "seqID")]
    pub seq_id: u64,
}

/// Replenishment signal sent to a device whose one-time key pool ran low.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedsOneTimeKey {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub needs: u32,
}

#[derive(Deserialize)]
struct BatchBody {
    batch: Vec<IncomingMessage>,
}

/// Batch body parse failure.
#[derive(Debug)]
pub enum ParseError {
    /// Body ended before the declared element count was read.
    Truncated,
    /// A deviceId field was not valid UTF-8.
    DeviceId,
    /// The JSON form failed to decode.
    Json(serde_json::Error),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "truncated batch body"),
            ParseError::DeviceId => write!(f, "deviceId is not valid UTF-8"),
            ParseError::Json(e) => write!(f, "invalid batch JSON: {e}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        ParseError::Json(e)
    }
}

/// Parses a `/message` request body in either accepted form.
pub fn parse_batch(body: &[u8]) -> Result<Vec<IncomingMessage>, ParseError> {
    match body.first() {
        None => Err(ParseError::Truncated),
        Some(b'{') => {
            let wrapper: BatchBody = serde_json::from_slice(body)?;
            Ok(wrapper.batch)
        }
        Some(_) => parse_binary(body),
    }
}

fn parse_binary(body: &[u8]) -> Result<Vec<IncomingMessage>, ParseError> {
    let mut rest = body;
    let count = take_byte(&mut rest)?;
    let mut batch = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let device_id = std::str::from_utf8(take_chunk(&mut rest)?)
            .map_err(|_| ParseError::DeviceId)?
            .to_string();
        let payload = take_chunk(&mut rest)?;
        batch.push(IncomingMessage {
            device_id,
            payload: Value::String(String::from_utf8_lossy(payload).into_owned()),
        });
    }
    Ok(batch)
}

fn take_byte(rest: &mut &[u8]) -> Result<u8, ParseError> {
    let (&byte, tail) = rest.split_first().ok_or(ParseError::Truncated)?;
    *rest = tail;
    Ok(byte)
}

fn take_chunk<'a>(rest: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = take_byte(rest)? as usize;
    if rest.len() < len {
        return Err(ParseError::Truncated);
    }
    let (chunk, tail) = rest.split_at(len);
    *rest = tail;
    Ok(chunk)
}
