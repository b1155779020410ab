//! Best-effort decoding of the structured records inside log chunks.
//!
//! Each extracted byte-string chunk carries a run of CBOR maps: `{seq, data}`
//! envelopes whose `data` payloads are themselves `{ts, msg, level, type}`
//! log entries. Nothing downstream depends on this structure — the raw chunk
//! bytes are what gets persisted — so decoding exists purely to make `debug`
//! logs useful, and every failure is silent.
//!
//! Concatenated values are split by decoding growing prefixes: a prefix that
//! ends mid-value fails with end-of-input, and the first success marks the
//! value boundary.

use ciborium::Value;
use tracing::debug;

/// A `{seq, data}` envelope.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub seq: u64,
    pub data: Vec<u8>,
}

/// A `{ts, msg, level, type}` log entry.
#[derive(Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub ts: u64,
    pub msg: String,
    pub level: String,
    pub kind: String,
}

/// Emit `debug!` lines for whatever well-formed records a chunk contains.
pub fn trace_records(chunk: &[u8]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    for record in decode_envelopes(chunk) {
        match decode_one(&record.data).and_then(|(value, _)| parse_log_entry(&value)) {
            Some(entry) => debug!(
                seq = record.seq,
                ts = entry.ts,
                level = %entry.level,
                kind = %entry.kind,
                msg = %entry.msg,
                "pod log entry"
            ),
            None => debug!(seq = record.seq, len = record.data.len(), "pod log record"),
        }
    }
}

/// Decode every complete `{seq, data}` envelope at the front of `data`.
pub fn decode_envelopes(data: &[u8]) -> Vec<ChunkRecord> {
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let Some((value, consumed)) = decode_one(rest) else {
            break;
        };
        if let Some(record) = parse_envelope(&value) {
            records.push(record);
        }
        rest = &rest[consumed..];
    }
    records
}

/// Decode the first CBOR value in `data`, returning it with its byte length.
pub fn decode_one(data: &[u8]) -> Option<(Value, usize)> {
    for end in 1..=data.len() {
        if let Ok(value) = ciborium::from_reader::<Value, _>(&data[..end]) {
            return Some((value, end));
        }
    }
    None
}

fn parse_envelope(value: &Value) -> Option<ChunkRecord> {
    let Value::Map(entries) = value else {
        return None;
    };
    let mut seq = None;
    let mut data = None;
    for (key, value) in entries {
        let Value::Text(key) = key else { continue };
        match (key.as_str(), value) {
            ("seq", Value::Integer(i)) => seq = u64::try_from(*i).ok(),
            ("data", Value::Bytes(b)) => data = Some(b.clone()),
            _ => {}
        }
    }
    Some(ChunkRecord {
        seq: seq?,
        data: data?,
    })
}

fn parse_log_entry(value: &Value) -> Option<LogEntry> {
    let Value::Map(entries) = value else {
        return None;
    };
    let mut ts = None;
    let mut msg = None;
    let mut level = None;
    let mut kind = None;
    for (key, value) in entries {
        let Value::Text(key) = key else { continue };
        match (key.as_str(), value) {
            ("ts", Value::Integer(i)) => ts = u64::try_from(*i).ok(),
            ("msg", Value::Text(s)) => msg = Some(s.clone()),
            ("level", Value::Text(s)) => level = Some(s.clone()),
            ("type", Value::Text(s)) => kind = Some(s.clone()),
            _ => {}
        }
    }
    Some(LogEntry {
        ts: ts?,
        msg: msg?,
        level: level?,
        kind: kind?,
    })
}
