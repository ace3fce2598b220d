use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// One-time worker startup payload.
///
/// `code`/`signal` carry the previous occupant's exit reason when the slot is
/// a respawn, so the embedded application can tell a cold start from a
/// recovery start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    /// PIDs of all workers connected at the time of bootstrap.
    pub plist: Vec<u32>,
    /// When the master process came up.
    pub startup_time: DateTime<Utc>,
    /// Master PID.
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Stable id for this master instance (uuid tail + pid).
    pub unique_id: String,
}

/// Master → worker control messages.
/// Wire: `{ "type": "bootstrap", ... }` / `{ "type": "perf_measure" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterMessage {
    /// One-time startup trigger. Idempotent: workers ignore duplicates.
    Bootstrap(BootstrapInfo),
    /// Request the worker's current event-loop lag.
    PerfMeasure,
    /// Reserved. Workers acknowledge by doing nothing.
    Close,
}

/// Worker → master reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The embedded server is bound on `127.0.0.1:port` and accepting
    /// proxied connections.
    Ready { id: usize, port: u16 },
    /// Lag sample in milliseconds; -1 means sampling is disabled or has not
    /// produced a value yet.
    EventLoop { id: usize, delay: i64 },
}

/// Serialize a message as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one wire line. Surrounding whitespace is tolerated.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}
