//! Wire protocol between the host and engine worker processes.
//!
//! Uses length-prefixed rkyv messages over a loopback TCP stream.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted message body (100MB).
const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// A value crossing the process boundary.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Value {
    /// `NULL`, or an empty vector.
    Null,
    Logical(bool),
    Integer(i32),
    Integers(Vec<i32>),
    Scalar(f64),
    Numeric(Vec<f64>),
    Text(String),
}

impl Value {
    /// Collapse one-element vectors to scalars and empty vectors to `Null`.
    pub fn normalized(self) -> Self {
        match self {
            Value::Integers(v) if v.is_empty() => Value::Null,
            Value::Integers(v) if v.len() == 1 => Value::Integer(v[0]),
            Value::Numeric(v) if v.is_empty() => Value::Null,
            Value::Numeric(v) if v.len() == 1 => Value::Scalar(v[0]),
            other => other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Scalar(x) if x.fract() == 0.0 && x.abs() <= i32::MAX as f64 => Some(*x as i32),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value; integers are widened.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Value::Null => Some(Vec::new()),
            Value::Integer(i) => Some(vec![f64::from(*i)]),
            Value::Integers(v) => Some(v.iter().map(|&i| f64::from(i)).collect()),
            Value::Scalar(x) => Some(vec![*x]),
            Value::Numeric(v) => Some(v.clone()),
            Value::Logical(_) | Value::Text(_) => None,
        }
    }

    /// Engine type name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Logical(_) => "logical",
            Value::Integer(_) | Value::Integers(_) => "integer",
            Value::Scalar(_) | Value::Numeric(_) => "double",
            Value::Text(_) => "character",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i)
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Self {
        Value::Integers(v)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Numeric(v)
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::Numeric(v.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Render `text` as a double-quoted engine string literal.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Request sent from the host to a worker.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum EngineRequest {
    /// First message on every connection.
    Hello {
        /// Per-instance credentials token.
        token: String,
    },

    /// Check that the worker is responsive.
    Ping,

    /// Evaluate engine source text and return its value.
    Eval { code: String },

    /// Bind a value to a name in the engine's global environment.
    Assign { name: String, value: Value },

    /// Fetch the value bound to a name.
    Collect { name: String },

    /// Ask a master instance for a fresh worker.
    SpawnWorker,

    /// Ask the worker to exit.
    Shutdown,
}

/// Response sent from a worker to the host.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum EngineResponse {
    /// Handshake accepted.
    Ready,

    /// Handshake rejected.
    Denied { reason: String },

    /// Response to `Ping`.
    Pong,

    /// Result of `Eval` or `Collect`.
    Value { value: Value },

    /// `Assign` completed.
    Done,

    /// The engine raised an error while evaluating.
    Fault { message: String },

    /// A master started a worker.
    Spawned {
        /// Port the new worker listens on.
        port: u16,
        /// OS process id of the new worker.
        pid: u32,
    },

    /// Acknowledgement of `Shutdown`.
    ShuttingDown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Validator used to check archived messages before decoding.
type Validator<'a> = rkyv::api::high::HighValidator<'a, rkyv::rancor::Error>;

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// The body is validated before it is decoded: the first frame on a worker
/// port comes from whoever connected, before any token has been checked.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<Validator<'a>>
        + Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    // Archived f64 payloads need an aligned buffer.
    let mut bytes = AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    rkyv::from_bytes::<T, rkyv::rancor::Error>(&bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}
