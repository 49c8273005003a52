// SPDX-License-Identifier: MIT
//! Wire protocol between the registry and the worker process.
//!
//! Requests are one UTF-8 line `functionName(arg1,arg2,...)\n` with every
//! argument encoded as one compact JSON value. Responses are one line per
//! request, in strict order, with no pipelining and no request ids. Lines
//! beginning with the reserved `L` marker carry out-of-band JSON log records
//! and do not terminate a read; the first ordinary line is the reply: a JSON
//! string means "worker-raised exception", any other value is the result.

use serde_json::Value;

/// Reserved marker for out-of-band log-record lines. No JSON value can
/// start with this byte, so classification is unambiguous.
pub const LOG_LINE_MARKER: char = 'L';

/// One line received from the worker, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Out-of-band log record; the read for the pending request continues.
    Log(Value),
    /// The reply to the pending request.
    Result(Value),
}

/// Encode one request line, newline included.
///
/// String arguments become quoted JSON literals (control characters escaped,
/// backslash and quote escaped); all other arguments use their JSON literal
/// syntax.
pub fn encode_request(func: &str, args: &[Value]) -> String {
    let mut line = String::with_capacity(func.len() + 16 * args.len());
    line.push_str(func);
    line.push('(');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&arg.to_string());
    }
    line.push_str(")\n");
    line
}

/// Decode one reply line (newline already stripped).
///
/// Fails on an empty line or malformed JSON — both are treated as a terminal
/// desync by the supervisor.
pub fn decode_line(line: &str) -> Result<Reply, serde_json::Error> {
    match line.strip_prefix(LOG_LINE_MARKER) {
        Some(record) => Ok(Reply::Log(serde_json::from_str(record)?)),
        None => Ok(Reply::Result(serde_json::from_str(line)?)),
    }
}

/// Truncate a wire line for logging, keeping at most `max` characters.
pub(crate) fn truncate_for_log(line: &str, max: usize) -> String {
    let trimmed = line.trim_end_matches('\n');
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
