//! `hive-cluster` — master/worker process coordination with sticky-session
//! connection distribution.
//!
//! The master owns the public TCP listener and a fixed set of worker
//! processes (respawned in place on abnormal exit). Each inbound connection
//! is routed to one worker — by lowest event-loop lag when perf monitoring is
//! on, by round-robin when enabled, otherwise by a stable hash of the client
//! address — and proxied to that worker's loopback server. Control traffic
//! rides the workers' stdin/stdout as `hive-protocol` JSON lines.

pub mod master;
pub mod monitor;
pub mod worker;

pub use master::ClusterMaster;
pub use worker::{ClusterWorker, WorkerApp};

use std::time::Duration;

use hive_core::config::SHUTDOWN_GRACE_MS;

/// Crash-and-restart policy for process-fatal errors: log the panic, give
/// in-flight log writes a grace period, then exit so the supervisor (or the
/// master, for workers) restarts the process.
pub fn install_fatal_error_handler() {
    std::panic::set_hook(Box::new(|info| {
        // panics in a contained scope (scheduler firings) are caught and
        // logged at their catch site; only unhandled ones are process-fatal
        if hive_core::panics::is_contained() {
            return;
        }
        tracing::error!(panic = %info, "fatal error, exiting after grace period");
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS));
            std::process::exit(1);
        });
    }));
}
