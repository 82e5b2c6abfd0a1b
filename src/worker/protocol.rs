//! Wire protocol between a worker parent and its child evaluator.
//!
//! The pipe carries alternating [`Request`] and [`Response`] records. Each
//! record is framed as a u32 big-endian length prefix followed by a JSON
//! document, so both ends can delimit records without sniffing payload
//! content. Requests and responses pair exclusively by id; the child never
//! initiates a message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// An evaluation request sent to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Namespace the expression is evaluated in. Evaluators that have no
    /// notion of namespaces ignore it.
    pub module: String,
    /// The expression to evaluate.
    pub expr: String,
    /// Random 64-bit id pairing this request with its response. Uniqueness
    /// is only required among in-flight requests; the collision probability
    /// at that scale is negligible.
    pub id: u64,
    /// When set, the child exits its serve loop without responding. The
    /// other fields are ignored.
    pub shutdown: bool,
}

impl Request {
    /// Builds an evaluation request.
    #[must_use]
    pub fn eval(module: impl Into<String>, expr: impl Into<String>, id: u64) -> Self {
        Self {
            module: module.into(),
            expr: expr.into(),
            id,
            shutdown: false,
        }
    }

    /// Builds the shutdown sentinel request.
    #[must_use]
    pub fn shutdown() -> Self {
        Self {
            module: String::new(),
            expr: String::new(),
            id: 0,
            shutdown: true,
        }
    }
}

/// The child's answer to a single [`Request`].
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The id of the request this answers.
    pub id: u64,
    /// The evaluated value, on success.
    pub result: Option<serde_json::Value>,
    /// The captured evaluation failure, on error.
    pub error: Option<EvalError>,
}

impl Response {
    /// Builds a success response.
    #[must_use]
    pub fn ok(id: u64, value: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(value),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn err(id: u64, error: EvalError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A child-side evaluation failure, carried over the wire as data.
///
/// The backtrace is captured where the failure happened (in the child) so
/// the parent can surface it to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalError {
    message: String,
    backtrace: Vec<String>,
}

impl EvalError {
    /// Creates an error with a backtrace captured at the call site.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        let backtrace = std::backtrace::Backtrace::force_capture()
            .to_string()
            .lines()
            .map(str::to_owned)
            .collect();
        Self {
            message: message.into(),
            backtrace,
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Child-side backtrace lines, innermost first.
    #[must_use]
    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Writes one length-prefixed record and flushes.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length exceeds MAX_FRAME_LEN",
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame length exceeds u32"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Reads one length-prefixed record.
///
/// Returns `Ok(None)` on a clean end-of-stream (EOF before any header
/// byte). EOF inside a frame is an error: the peer went away mid-record.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut header = [0_u8; 4];
    match read_exact_or_eof(reader, &mut header)? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Filled => {}
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length exceeds MAX_FRAME_LEN",
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

enum ReadOutcome {
    Filled,
    Eof,
}

/// Like `read_exact`, but distinguishes EOF-at-a-record-boundary from
/// EOF-mid-record.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Eof),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(ReadOutcome::Filled)
}
