//! `hive-protocol` — the master↔worker control-channel wire types.
//!
//! Messages travel as one JSON object per line over the worker's
//! stdin (master→worker) and stdout (worker→master). Each direction is a
//! closed enum tagged by a `type` field, so unknown or malformed frames fail
//! at decode time instead of falling through a string `match`.

pub mod messages;

pub use messages::{decode_line, encode_line, BootstrapInfo, MasterMessage, WorkerMessage};
