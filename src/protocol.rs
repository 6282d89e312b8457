//! Wire protocol: command envelopes and JSON frame extraction.
//!
//! Commands travel as newline-free JSON objects concatenated back-to-back on
//! a single TCP stream. Frame boundaries are inferred by brace balance, not
//! length prefixes: the first position where the count of `{` equals the
//! (non-zero) count of `}` ends one frame. Braces inside JSON string literals
//! are *not* accounted for; payloads containing unbalanced braces in string
//! values will misframe. This matches the deployed peers and is kept as a
//! documented limitation rather than fixed.
//!
//! The bare literal `kill` is a reserved out-of-band shutdown signal,
//! recognized before any JSON parsing is attempted.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::VcapError;

/// Parameter payload of a command: an arbitrary JSON object.
pub type ParameterMap = Map<String, Value>;

/// Out-of-band shutdown signal sent instead of a JSON frame.
pub const KILL_SIGNAL: &[u8] = b"kill";

/// Discriminates requests from replies on the wire (`type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Trigger,
    Response,
}

/// One protocol envelope.
///
/// A `trigger` requests execution of a capability; a `response` answers it.
/// A trigger that expects a reply carries a unique correlation id in `src`,
/// which the matching response echoes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterMap>,
    /// Correlation id pairing this command with its eventual response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Streaming rate in Hz: `0` one-shot, `> 0` start or replace a periodic
    /// invocation, `< 0` cancel it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<f64>,
    /// Present on a failed response; sanitized to stay JSON-safe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Command {
    pub fn trigger(capability: impl Into<String>, parameters: ParameterMap) -> Self {
        Self {
            kind: CommandType::Trigger,
            capability: capability.into(),
            parameters: Some(parameters),
            src: None,
            streaming: None,
            error: None,
        }
    }

    /// Builds the response envelope for a trigger, echoing `capability`,
    /// `src` and `streaming` when present.
    pub fn response_to(trigger: &Command) -> Self {
        Self {
            kind: CommandType::Response,
            capability: trigger.capability.clone(),
            parameters: None,
            src: trigger.src.clone(),
            streaming: trigger.streaming,
            error: None,
        }
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_streaming(mut self, rate: f64) -> Self {
        self.streaming = Some(rate);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, VcapError> {
        serde_json::to_vec(self).map_err(|e| VcapError::MalformedCommand(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, VcapError> {
        serde_json::from_slice(bytes).map_err(|e| VcapError::MalformedCommand(e.to_string()))
    }
}

/// Strips characters that would break the surrounding JSON when a handler
/// failure message is embedded in a response `error` field.
pub fn sanitize_error(message: &str) -> String {
    message.replace(['"', '\\'], "")
}

/// One frame extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// A complete JSON object, still unparsed.
    Json(Bytes),
    /// The bare `kill` shutdown signal.
    Kill,
}

/// Accumulates raw socket bytes and splits off complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Scans the buffered bytes for one complete frame and consumes it.
    ///
    /// Returns `None` when no complete frame has arrived yet; the partial
    /// bytes stay buffered for the next scan.
    pub fn next_frame(&mut self) -> Option<WireFrame> {
        if self.buf.as_ref() == KILL_SIGNAL {
            self.buf.clear();
            return Some(WireFrame::Kill);
        }

        let mut open = 0usize;
        let mut close = 0usize;
        for (i, &byte) in self.buf.iter().enumerate() {
            match byte {
                b'{' => open += 1,
                b'}' => close += 1,
                _ => {}
            }
            if open > 0 && open == close {
                let frame = self.buf.split_to(i + 1);
                return Some(WireFrame::Json(frame.freeze()));
            }
        }
        None
    }
}
