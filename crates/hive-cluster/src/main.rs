use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hive_cluster::{install_fatal_error_handler, ClusterMaster, ClusterWorker, WorkerApp};
use hive_core::HiveConfig;
use hive_protocol::BootstrapInfo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hive-cluster", version, about = "Clustered master/worker TCP front-end")]
struct Cli {
    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand)]
enum Role {
    /// Listen, spawn the worker set, and distribute connections (default).
    Master,
    /// Run as a worker process. Spawned by the master, not by hand.
    Worker {
        /// Slot index assigned by the master.
        #[arg(long)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let role = cli.role.unwrap_or(Role::Master);

    // worker stdout carries IPC frames, so its logs go to stderr
    init_tracing(matches!(role, Role::Worker { .. }));
    install_fatal_error_handler();

    let config = HiveConfig::load(None).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        HiveConfig::default()
    });

    match role {
        Role::Master => {
            let master = ClusterMaster::new(config);
            let runner = Arc::clone(&master);
            tokio::select! {
                result = runner.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    master.shutdown();
                }
            }
        }
        Role::Worker { index } => {
            let app = StatusApp { index };
            let worker = ClusterWorker::new(index, config.listen.enable_perf_monitor, app);
            worker.run().await?;
        }
    }

    Ok(())
}

fn init_tracing(to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

/// Built-in application: answers every request with a JSON status line
/// identifying the worker that served it. Useful for smoke-testing the
/// dispatch modes; real deployments supply their own [`WorkerApp`].
struct StatusApp {
    index: usize,
}

#[async_trait]
impl WorkerApp for StatusApp {
    async fn bootstrap(&self, boot: &BootstrapInfo) -> hive_core::Result<()> {
        info!(
            worker = self.index,
            master = boot.process_id,
            peers = boot.plist.len(),
            prior_code = ?boot.code,
            "application bootstrap"
        );
        Ok(())
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;

        let body = serde_json::json!({
            "worker": self.index,
            "pid": std::process::id(),
        })
        .to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );

        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
        tracing::debug!(worker = self.index, %peer, "served status request");
    }
}
