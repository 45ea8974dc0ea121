//! Command request container with typed argument accessors.

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors produced by the typed argument accessors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgError {
    /// The requested index is past the end of the argument list.
    #[error("missing argument {index}: only {count} provided")]
    Missing { index: usize, count: usize },

    /// The argument is not a decimal integer.
    #[error("argument {index} is not an integer")]
    NotInt { index: usize },

    /// The argument is not valid UTF-8 where text was expected.
    #[error("argument {index} is not valid UTF-8")]
    NotUtf8 { index: usize },
}

/// A single command as parsed from a client connection.
///
/// The command name is stored uppercase; matching is therefore
/// case-insensitive on input. `id` stays 0 until the keeper stamps the
/// request while appending it to the write-ahead log. `timestamp` is the
/// creation time in seconds since the Unix epoch and is what makes TTL
/// arguments replayable (see `Processor::normalize_ttl`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Sequence id assigned by the keeper; 0 until written to the WAL.
    pub id: i64,
    /// Uppercase command name.
    pub cmd: String,
    /// Positional arguments, binary-safe.
    pub args: Vec<Bytes>,
    /// True when the client pipelined past this command and is not waiting
    /// for an individual acknowledgement.
    pub unreliable: bool,
}

impl Request {
    /// Creates a request stamped with the current time.
    pub fn new(cmd: &str, args: Vec<Bytes>) -> Self {
        Self {
            timestamp: now_unix_secs(),
            id: 0,
            cmd: cmd.to_uppercase(),
            args,
            unreliable: false,
        }
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns argument `i` as raw bytes.
    pub fn arg_bytes(&self, i: usize) -> Result<Bytes, ArgError> {
        self.args.get(i).cloned().ok_or(ArgError::Missing {
            index: i,
            count: self.args.len(),
        })
    }

    /// Returns argument `i` as a UTF-8 string slice.
    pub fn arg_str(&self, i: usize) -> Result<&str, ArgError> {
        let arg = self.args.get(i).ok_or(ArgError::Missing {
            index: i,
            count: self.args.len(),
        })?;
        std::str::from_utf8(arg).map_err(|_| ArgError::NotUtf8 { index: i })
    }

    /// Returns argument `i` parsed as a decimal signed integer.
    pub fn arg_int(&self, i: usize) -> Result<i64, ArgError> {
        self.arg_str(i)?
            .parse()
            .map_err(|_| ArgError::NotInt { index: i })
    }

    /// Returns all arguments from index `i` on as strings.
    pub fn tail_strings(&self, i: usize) -> Result<Vec<String>, ArgError> {
        if i >= self.args.len() {
            return Err(ArgError::Missing {
                index: i,
                count: self.args.len(),
            });
        }
        (i..self.args.len())
            .map(|j| self.arg_str(j).map(str::to_string))
            .collect()
    }

    /// Returns all arguments from index `i` on as raw bytes.
    pub fn tail_bytes(&self, i: usize) -> Result<Vec<Bytes>, ArgError> {
        if i >= self.args.len() {
            return Err(ArgError::Missing {
                index: i,
                count: self.args.len(),
            });
        }
        Ok(self.args[i..].to_vec())
    }
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
