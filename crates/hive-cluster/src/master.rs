//! Master process: public listener, worker lifecycle, connection dispatch.

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_core::config::{HiveConfig, PERF_MONITOR_INTERVAL_MS};
use hive_protocol::{decode_line, encode_line, BootstrapInfo, MasterMessage, WorkerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::monitor::LagProbe;

/// Exit code of a forcibly terminated process on Windows
/// (STATUS_CONTROL_C_EXIT); treated like a clean exit for respawn purposes.
pub const FORCED_TERMINATION_CODE: i32 = 0xC000013A_u32 as i32;

/// One worker slot. A slot survives its occupant: on respawn the same index
/// is refilled, carrying the previous exit reason into the next bootstrap.
struct WorkerSlot {
    pid: Option<u32>,
    /// Loopback port of the worker's embedded server, once advertised.
    port: Option<u16>,
    closing: bool,
    code: Option<i32>,
    signal: Option<String>,
    /// Last lag pushed by the worker; -1 while a probe answer is pending.
    event_loop_delay: i64,
    probe: LagProbe,
    control_tx: Option<mpsc::UnboundedSender<MasterMessage>>,
}

impl WorkerSlot {
    fn vacant() -> Self {
        Self {
            pid: None,
            port: None,
            closing: false,
            code: None,
            signal: None,
            event_loop_delay: -1,
            probe: LagProbe::new(),
            control_tx: None,
        }
    }

    /// A slot that can take a proxied connection right now.
    fn available_port(&self) -> Option<u16> {
        if self.closing {
            None
        } else {
            self.port
        }
    }
}

/// What to do with a slot whose worker exited.
#[derive(Debug, PartialEq, Eq)]
enum ExitAction {
    /// Abnormal exit: refill the same slot immediately.
    Respawn,
    /// Clean or forced exit: leave the slot empty. When the exit was part of
    /// a graceful close and no live worker remains, respawn the full set.
    Retire { reinit_if_empty: bool },
}

/// Respawn policy. A `closing` slot is never resurrected, whatever the code.
fn exit_action(code: Option<i32>, closing: bool) -> ExitAction {
    if closing {
        return ExitAction::Retire {
            reinit_if_empty: true,
        };
    }

    match code {
        Some(0) | Some(FORCED_TERMINATION_CODE) => ExitAction::Retire {
            reinit_if_empty: false,
        },
        _ => ExitAction::Respawn,
    }
}

/// Stable 32-bit fingerprint for sticky routing. Must produce the same value
/// for the same address in every process, so no seeded hasher.
fn fingerprint32(input: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    input
        .bytes()
        .fold(FNV_OFFSET, |hash, byte| (hash ^ byte as u32).wrapping_mul(FNV_PRIME))
}

enum DispatchTarget {
    Proxy { index: usize, port: u16 },
    /// The computed index points past the slot vector — only possible in the
    /// narrow startup/shutdown window before slots exist.
    OutOfRange,
    NoWorkers,
}

/// Owns the listening socket and the worker set.
pub struct ClusterMaster {
    config: HiveConfig,
    startup_time: DateTime<Utc>,
    unique_id: String,
    worker_count: usize,
    slots: Mutex<Vec<WorkerSlot>>,
    rr_cursor: AtomicUsize,
    /// Slot index of the currently fastest worker, -1 when unknown.
    fastest_worker: AtomicI64,
}

impl ClusterMaster {
    pub fn new(config: HiveConfig) -> Arc<Self> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let tail = uuid.rsplit('-').next().unwrap_or("0").to_string();
        let worker_count = config.effective_worker_count();

        Arc::new(Self {
            config,
            startup_time: Utc::now(),
            unique_id: format!("{}-{}", tail, std::process::id()),
            worker_count,
            slots: Mutex::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            fastest_worker: AtomicI64::new(-1),
        })
    }

    /// Bind the public listener, bring up the worker set, and serve forever.
    pub async fn run(self: Arc<Self>) -> hive_core::Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.listen.hostname, self.config.listen.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(
            %addr,
            workers = self.worker_count,
            product = %self.config.settings.product_name,
            unique_id = %self.unique_id,
            "master listening"
        );

        self.init_workers();

        if self.config.listen.enable_perf_monitor {
            let master = Arc::clone(&self);
            tokio::spawn(async move { master.poll_worker_lag().await });
        }

        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let master = Arc::clone(&self);
                    tokio::spawn(async move { master.dispatch(conn, peer.ip().to_string()).await });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }

    /// Mark every worker as closing and tell it so. Retired slots are not
    /// respawned after this.
    pub fn shutdown(&self) {
        info!("closing worker set");
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            slot.closing = true;
            if let Some(tx) = &slot.control_tx {
                let _ = tx.send(MasterMessage::Close);
            }
        }
    }

    fn init_workers(self: &Arc<Self>) {
        for index in 0..self.worker_count {
            let occupied = {
                let slots = self.slots.lock().unwrap();
                slots.get(index).map(|s| s.pid.is_some()).unwrap_or(false)
            };
            if !occupied {
                self.spawn_worker(index, None, None);
            }
        }
    }

    /// Fork a worker into `index`, wiring its stdio as the control channel.
    /// `code`/`signal` are the previous occupant's exit reason, if any.
    fn spawn_worker(self: &Arc<Self>, index: usize, code: Option<i32>, signal: Option<String>) {
        let exe = match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                error!(worker = index, error = %e, "cannot resolve worker executable");
                return;
            }
        };

        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--index")
            .arg(index.to_string())
            .env(
                "HIVE_LISTEN__ENABLE_PERF_MONITOR",
                self.config.listen.enable_perf_monitor.to_string(),
            )
            .env(
                "HIVE_SETTINGS__PRODUCT_NAME",
                &self.config.settings.product_name,
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(worker = index, error = %e, "failed to spawn worker");
                return;
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<MasterMessage>();

        {
            let mut slots = self.slots.lock().unwrap();
            while slots.len() <= index {
                slots.push(WorkerSlot::vacant());
            }
            let slot = &mut slots[index];
            *slot = WorkerSlot::vacant();
            slot.pid = pid;
            slot.code = code;
            slot.signal = signal;
            slot.control_tx = Some(control_tx);
        }

        info!(worker = index, pid, "worker spawned");

        if let Some(mut stdin) = stdin {
            tokio::spawn(async move {
                while let Some(message) = control_rx.recv().await {
                    match encode_line(&message) {
                        Ok(line) => {
                            if stdin.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode control message"),
                    }
                }
            });
        }

        if let Some(stdout) = stdout {
            let master = Arc::clone(self);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match decode_line::<WorkerMessage>(&line) {
                        Ok(message) => master.handle_worker_message(index, message),
                        Err(e) => warn!(worker = index, error = %e, "unparseable worker report"),
                    }
                }
            });
        }

        let master = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let code = status.as_ref().and_then(|s| s.code());
            let signal = exit_signal(status.as_ref());
            master.handle_worker_exit(index, code, signal);
        });

        // the new worker bootstraps off this; it cannot send Ready before
        self.broadcast_bootstrap();
    }

    fn handle_worker_message(self: &Arc<Self>, index: usize, message: WorkerMessage) {
        match message {
            WorkerMessage::Ready { id, port } => {
                if id != index {
                    warn!(worker = index, reported = id, "worker reported a foreign id");
                }
                {
                    let mut slots = self.slots.lock().unwrap();
                    if let Some(slot) = slots.get_mut(index) {
                        slot.port = Some(port);
                    }
                }
                info!(worker = index, port, "worker ready");
                self.broadcast_bootstrap();
            }
            WorkerMessage::EventLoop { delay, .. } => {
                let mut slots = self.slots.lock().unwrap();
                if let Some(slot) = slots.get_mut(index) {
                    if !slot.closing {
                        slot.event_loop_delay = delay;
                    }
                }
            }
        }
    }

    /// Send the bootstrap trigger to every live worker, including ones that
    /// have not advertised a port yet: bootstrap is what makes a worker bind
    /// and send Ready in the first place. Workers that already bootstrapped
    /// ignore the duplicate, so re-broadcasting on each spawn and each Ready
    /// is safe and keeps `plist` fresh for late joiners.
    fn broadcast_bootstrap(&self) {
        let slots = self.slots.lock().unwrap();
        let plist: Vec<u32> = slots
            .iter()
            .filter(|s| !s.closing)
            .filter_map(|s| s.pid)
            .collect();

        for (index, slot) in slots.iter().enumerate() {
            if slot.closing {
                continue;
            }
            let Some(tx) = &slot.control_tx else { continue };

            let message = MasterMessage::Bootstrap(BootstrapInfo {
                plist: plist.clone(),
                startup_time: self.startup_time,
                process_id: std::process::id(),
                code: slot.code,
                signal: slot.signal.clone(),
                unique_id: self.unique_id.clone(),
            });

            if tx.send(message).is_err() {
                warn!(worker = index, "failed to queue bootstrap");
            }
        }
    }

    fn handle_worker_exit(self: &Arc<Self>, index: usize, code: Option<i32>, signal: Option<String>) {
        let closing = {
            let slots = self.slots.lock().unwrap();
            slots.get(index).map(|s| s.closing).unwrap_or(false)
        };

        match exit_action(code, closing) {
            ExitAction::Respawn => {
                info!(worker = index, ?code, ?signal, "respawning worker");
                self.spawn_worker(index, code, signal);
            }
            ExitAction::Retire { reinit_if_empty } => {
                info!(worker = index, ?code, ?signal, "worker retired");
                {
                    let mut slots = self.slots.lock().unwrap();
                    if let Some(slot) = slots.get_mut(index) {
                        slot.pid = None;
                        slot.port = None;
                        slot.control_tx = None;
                        slot.code = code;
                        slot.signal = signal;
                    }
                }

                if reinit_if_empty {
                    let none_live = {
                        let slots = self.slots.lock().unwrap();
                        slots.iter().all(|s| s.pid.is_none())
                    };
                    if none_live {
                        info!("no live workers left, reinitializing worker set");
                        {
                            let mut slots = self.slots.lock().unwrap();
                            for slot in slots.iter_mut() {
                                slot.closing = false;
                            }
                        }
                        self.init_workers();
                    }
                }
            }
        }
    }

    /// Priority order: fastest worker when lag monitoring knows one, then
    /// round-robin if enabled, then sticky hash of the client address.
    fn pick_index(&self, remote_addr: &str) -> usize {
        if self.config.listen.enable_perf_monitor {
            let fastest = self.fastest_worker.load(Ordering::Relaxed);
            if fastest >= 0 {
                return fastest as usize;
            }
        }

        if self.config.listen.enable_round_robin {
            return self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.worker_count;
        }

        fingerprint32(remote_addr) as usize % self.worker_count
    }

    /// Resolve a picked index to a proxyable slot, falling back to a
    /// backward scan over all slots when the pick is unavailable.
    fn select_target(&self, index: usize) -> DispatchTarget {
        let slots = self.slots.lock().unwrap();

        if index >= slots.len() {
            return DispatchTarget::OutOfRange;
        }

        if let Some(port) = slots[index].available_port() {
            return DispatchTarget::Proxy { index, port };
        }

        for (i, slot) in slots.iter().enumerate().rev() {
            if let Some(port) = slot.available_port() {
                return DispatchTarget::Proxy { index: i, port };
            }
        }

        DispatchTarget::NoWorkers
    }

    /// Remaining proxy candidates in backward-scan order, excluding one
    /// already-failed index.
    fn fallback_candidates(&self, exclude: usize) -> Vec<(usize, u16)> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .rev()
            .filter(|(i, _)| *i != exclude)
            .filter_map(|(i, slot)| slot.available_port().map(|port| (i, port)))
            .collect()
    }

    async fn dispatch(self: Arc<Self>, mut conn: TcpStream, remote_addr: String) {
        let index = self.pick_index(&remote_addr);

        match self.select_target(index) {
            DispatchTarget::Proxy { index, port } => {
                if proxy_to(index, port, &mut conn).await {
                    return;
                }
                for (i, p) in self.fallback_candidates(index) {
                    if proxy_to(i, p, &mut conn).await {
                        return;
                    }
                }
                error!(remote = %remote_addr, "no available workers");
                destroy(&conn);
            }
            DispatchTarget::NoWorkers => {
                error!(remote = %remote_addr, "no available workers");
                destroy(&conn);
            }
            DispatchTarget::OutOfRange => {
                debug!(
                    remote = %remote_addr,
                    index,
                    "connection arrived before any worker slot existed"
                );
                reject_out_of_range(&mut conn, index).await;
            }
        }
    }

    /// Poll every live worker's lag, age silent ones, request a fresh
    /// sample, and publish the fastest slot for dispatch.
    async fn poll_worker_lag(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(PERF_MONITOR_INTERVAL_MS));

        loop {
            ticker.tick().await;
            let now = tokio::time::Instant::now();
            let mut fastest: Option<(usize, i64)> = None;

            {
                let mut slots = self.slots.lock().unwrap();
                for (index, slot) in slots.iter_mut().enumerate() {
                    if slot.closing || slot.port.is_none() {
                        continue;
                    }
                    let Some(tx) = &slot.control_tx else { continue };

                    let delay = slot.probe.observe(slot.event_loop_delay, now);
                    slot.event_loop_delay = -1;
                    let _ = tx.send(MasterMessage::PerfMeasure);

                    if fastest.map_or(true, |(_, best)| delay < best) {
                        fastest = Some((index, delay));
                    }
                }
            }

            self.fastest_worker
                .store(fastest.map_or(-1, |(i, _)| i as i64), Ordering::Relaxed);
        }
    }
}

/// Connect to the worker's loopback server and shovel bytes both ways.
/// Returns false when the worker cannot be reached, so the caller can fall
/// back to another slot; once the proxy is up the dispatch is final.
async fn proxy_to(index: usize, port: u16, conn: &mut TcpStream) -> bool {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(mut upstream) => {
            if let Err(e) = tokio::io::copy_bidirectional(conn, &mut upstream).await {
                debug!(worker = index, error = %e, "proxied connection ended with error");
            }
            true
        }
        Err(e) => {
            warn!(worker = index, error = %e, "failed to proxy connection to worker");
            false
        }
    }
}

/// Synthetic answer for the out-of-range window so the client gets a
/// well-formed response instead of a bare reset.
async fn reject_out_of_range(conn: &mut TcpStream, index: usize) {
    let body = serde_json::json!({
        "state": format!("Worker with index '{index}' is not available."),
    })
    .to_string();

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    let _ = conn.write_all(response.as_bytes()).await;
    let _ = conn.shutdown().await;
}

/// Undispatchable connections are reset, not closed: linger 0 turns the
/// close into an RST so the client sees a failure instead of an empty reply.
fn destroy(conn: &TcpStream) {
    let _ = conn.set_linger(Some(Duration::ZERO));
}

#[cfg(unix)]
fn exit_signal(status: Option<&std::process::ExitStatus>) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.and_then(|s| s.signal()).map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: Option<&std::process::ExitStatus>) -> Option<String> {
    None
}

/// Conventional name for the signals a worker plausibly dies from; anything
/// else is reported as its bare number.
#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".into(),
        2 => "SIGINT".into(),
        3 => "SIGQUIT".into(),
        6 => "SIGABRT".into(),
        9 => "SIGKILL".into(),
        11 => "SIGSEGV".into(),
        13 => "SIGPIPE".into(),
        15 => "SIGTERM".into(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master(worker_count: usize, round_robin: bool, perf: bool) -> ClusterMaster {
        let mut config = HiveConfig::default();
        config.listen.enable_round_robin = round_robin;
        config.listen.enable_perf_monitor = perf;

        ClusterMaster {
            config,
            startup_time: Utc::now(),
            unique_id: "test-0".into(),
            worker_count,
            slots: Mutex::new(Vec::new()),
            rr_cursor: AtomicUsize::new(0),
            fastest_worker: AtomicI64::new(-1),
        }
    }

    fn push_slot(master: &ClusterMaster, port: Option<u16>, closing: bool) {
        let mut slot = WorkerSlot::vacant();
        slot.pid = port.map(|_| 1);
        slot.port = port;
        slot.closing = closing;
        master.slots.lock().unwrap().push(slot);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint32("10.1.2.3"), fingerprint32("10.1.2.3"));
        assert_eq!(fingerprint32(""), 0x811c_9dc5); // FNV offset basis
        // same address always lands in the same slot
        let a = fingerprint32("192.168.0.7") as usize % 4;
        let b = fingerprint32("192.168.0.7") as usize % 4;
        assert_eq!(a, b);
    }

    #[test]
    fn hash_routing_is_sticky() {
        let master = test_master(4, false, false);
        let first = master.pick_index("203.0.113.9");
        for _ in 0..10 {
            assert_eq!(master.pick_index("203.0.113.9"), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn round_robin_cycles() {
        let master = test_master(3, true, false);
        let picks: Vec<usize> = (0..6).map(|_| master.pick_index("1.1.1.1")).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn fastest_worker_wins_over_other_modes() {
        let master = test_master(3, true, true);
        master.fastest_worker.store(2, Ordering::Relaxed);
        assert_eq!(master.pick_index("1.1.1.1"), 2);

        // unknown fastest falls through to round-robin
        master.fastest_worker.store(-1, Ordering::Relaxed);
        assert_eq!(master.pick_index("1.1.1.1"), 0);
    }

    #[test]
    fn exit_action_policy() {
        assert_eq!(exit_action(Some(1), false), ExitAction::Respawn);
        assert_eq!(exit_action(None, false), ExitAction::Respawn); // killed by signal
        assert_eq!(
            exit_action(Some(0), false),
            ExitAction::Retire {
                reinit_if_empty: false
            }
        );
        assert_eq!(
            exit_action(Some(FORCED_TERMINATION_CODE), false),
            ExitAction::Retire {
                reinit_if_empty: false
            }
        );
        // closing slots are never resurrected, whatever the exit code
        assert_eq!(
            exit_action(Some(0), true),
            ExitAction::Retire {
                reinit_if_empty: true
            }
        );
        assert_eq!(
            exit_action(Some(1), true),
            ExitAction::Retire {
                reinit_if_empty: true
            }
        );
    }

    #[test]
    fn select_target_prefers_the_picked_slot() {
        let master = test_master(3, false, false);
        push_slot(&master, Some(4000), false);
        push_slot(&master, Some(4001), false);
        push_slot(&master, Some(4002), false);

        match master.select_target(1) {
            DispatchTarget::Proxy { index, port } => {
                assert_eq!((index, port), (1, 4001));
            }
            _ => panic!("expected proxy target"),
        }
    }

    #[test]
    fn select_target_scans_backward_past_closing_slots() {
        let master = test_master(3, false, false);
        push_slot(&master, Some(4000), false);
        push_slot(&master, None, false); // picked, but no port yet
        push_slot(&master, Some(4002), true); // closing, skipped

        match master.select_target(1) {
            DispatchTarget::Proxy { index, port } => {
                assert_eq!((index, port), (0, 4000));
            }
            _ => panic!("expected fallback to slot 0"),
        }
    }

    #[test]
    fn select_target_edge_cases() {
        let master = test_master(3, false, false);
        assert!(matches!(
            master.select_target(0),
            DispatchTarget::OutOfRange
        ));

        push_slot(&master, None, false);
        push_slot(&master, Some(4001), true);
        assert!(matches!(master.select_target(0), DispatchTarget::NoWorkers));
    }

    #[tokio::test]
    async fn bootstrap_reaches_workers_before_they_are_ready() {
        let master = test_master(1, false, false);

        // freshly spawned: control channel up, no port advertised yet
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = WorkerSlot::vacant();
        slot.pid = Some(10);
        slot.control_tx = Some(tx);
        master.slots.lock().unwrap().push(slot);

        master.broadcast_bootstrap();

        let MasterMessage::Bootstrap(info) = rx.recv().await.unwrap() else {
            panic!("expected a bootstrap message");
        };
        assert_eq!(info.plist, vec![10]);
        assert_eq!(info.unique_id, "test-0");
    }

    #[tokio::test]
    async fn destroyed_connection_resets_the_client() {
        use tokio::io::AsyncReadExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        destroy(&server);
        drop(server);

        let mut buf = [0u8; 8];
        match client.read(&mut buf).await {
            Ok(0) => panic!("expected a reset, got a clean close"),
            Ok(n) => panic!("unexpected data ({n} bytes)"),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    #[cfg(unix)]
    fn signal_names_are_conventional() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(64), "64");
    }

    #[test]
    fn fallback_candidates_exclude_failed_index() {
        let master = test_master(3, false, false);
        push_slot(&master, Some(4000), false);
        push_slot(&master, Some(4001), false);
        push_slot(&master, Some(4002), false);

        assert_eq!(
            master.fallback_candidates(2),
            vec![(1, 4001), (0, 4000)]
        );
    }
}
