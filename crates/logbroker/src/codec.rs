// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line codec shared by the buffer file and the ClickHouse `TabSeparated` payload.
//!
//! A record is stored as `TIMESTAMP\tESCAPED_MESSAGE\n`. Escaping replaces
//! backslash, newline, tab and carriage return with their two-character
//! forms, so one record always occupies exactly one line.

use chrono::{DateTime, Utc};

/// Format used for the `ts` column, UTC with second precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One buffered log line together with its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRecord {
    pub timestamp: String,
    pub message: String,
}

impl BufferRecord {
    pub fn new(timestamp: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            message: message.into(),
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Escapes a message for `TabSeparated`. Backslash goes first so the
/// escapes introduced for the other characters are not doubled.
pub fn escape(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Inverse of [`escape`]. Unknown sequences and a trailing lone backslash
/// are kept as they are.
pub fn unescape(escaped: &str) -> String {
    let mut message = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            message.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => message.push('\\'),
            Some('n') => message.push('\n'),
            Some('t') => message.push('\t'),
            Some('r') => message.push('\r'),
            Some(other) => {
                message.push('\\');
                message.push(other);
            }
            None => message.push('\\'),
        }
    }
    message
}

/// Appends the encoded form of `record`, terminator included, to `out`.
pub fn encode_into(record: &BufferRecord, out: &mut String) {
    out.push_str(&record.timestamp);
    out.push('\t');
    out.push_str(&escape(&record.message));
    out.push('\n');
}

pub fn encode(record: &BufferRecord) -> String {
    let mut line = String::with_capacity(record.timestamp.len() + record.message.len() + 2);
    encode_into(record, &mut line);
    line
}

/// Encodes a whole batch as one payload, records in order.
pub fn encode_batch(records: &[BufferRecord]) -> String {
    let mut payload = String::new();
    for record in records {
        encode_into(record, &mut payload);
    }
    payload
}

/// Decodes one line, with or without its terminator.
///
/// Returns the record and whether the line was well formed. A line without
/// a TAB becomes a record whose timestamp is the whole line and whose
/// message is empty.
pub fn decode(line: &str) -> (BufferRecord, bool) {
    let line = line.strip_suffix('\n').unwrap_or(line);
    match line.split_once('\t') {
        Some((timestamp, escaped)) => (BufferRecord::new(timestamp, unescape(escaped)), true),
        None => (BufferRecord::new(line, ""), false),
    }
}
