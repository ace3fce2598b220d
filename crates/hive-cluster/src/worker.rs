//! Worker process: stdio control loop and the embedded loopback server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hive_core::config::WORKER_LAG_INTERVAL_MS;
use hive_core::{HiveError, Result};
use hive_protocol::{decode_line, encode_line, BootstrapInfo, MasterMessage, WorkerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// The application a worker hosts behind its loopback server.
#[async_trait]
pub trait WorkerApp: Send + Sync + 'static {
    /// One-time startup. Runs before the embedded server starts accepting,
    /// so the master cannot route a connection here until this returns.
    async fn bootstrap(&self, boot: &BootstrapInfo) -> Result<()>;

    /// Handle one proxied client connection.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

/// Drives one worker: reads master messages from stdin until EOF, writes
/// reports to stdout. Log output must go to stderr in this process.
pub struct ClusterWorker<A: WorkerApp> {
    index: usize,
    perf_monitor: bool,
    app: Arc<A>,
    started: broadcast::Sender<BootstrapInfo>,
}

impl<A: WorkerApp> ClusterWorker<A> {
    pub fn new(index: usize, perf_monitor: bool, app: A) -> Self {
        let (started, _) = broadcast::channel(4);
        Self {
            index,
            perf_monitor,
            app: Arc::new(app),
            started,
        }
    }

    /// Fires once, after the app bootstrapped and the server is accepting.
    pub fn on_started(&self) -> broadcast::Receiver<BootstrapInfo> {
        self.started.subscribe()
    }

    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        // single stdout writer so report frames never interleave
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(message) = report_rx.recv().await {
                match encode_line(&message) {
                    Ok(line) => {
                        if stdout.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                        let _ = stdout.flush().await;
                    }
                    Err(e) => warn!(error = %e, "failed to encode report"),
                }
            }
        });

        let mut bootstrapped = false;
        let mut sampler = None;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message: MasterMessage = match decode_line(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(worker = self.index, error = %e, "unparseable control message");
                    continue;
                }
            };

            match message {
                MasterMessage::Bootstrap(info) => {
                    if bootstrapped {
                        debug!(worker = self.index, "duplicate bootstrap ignored");
                        continue;
                    }
                    bootstrapped = true;

                    if let Err(e) = self.bootstrap(&info, &report_tx).await {
                        error!(worker = self.index, error = %e, "bootstrap failed");
                        return Err(e);
                    }

                    if self.perf_monitor {
                        sampler = Some(crate::monitor::LagSampler::start(WORKER_LAG_INTERVAL_MS));
                    }
                }
                MasterMessage::PerfMeasure => {
                    let delay = sampler.as_ref().map_or(-1, |s: &crate::monitor::LagSampler| s.current());
                    let _ = report_tx.send(WorkerMessage::EventLoop {
                        id: self.index,
                        delay,
                    });
                }
                // reserved: exit handling rides on stdin EOF instead
                MasterMessage::Close => {}
            }
        }

        info!(worker = self.index, "control channel closed, shutting down");
        writer.abort();
        Ok(())
    }

    /// Run the app's startup, bind the loopback server, and advertise the
    /// port. Until Ready goes out the master falls back to other slots.
    async fn bootstrap(
        &self,
        info: &BootstrapInfo,
        report_tx: &mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<()> {
        self.app.bootstrap(info).await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        let app = Arc::clone(&self.app);
        let index = self.index;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let app = Arc::clone(&app);
                        tokio::spawn(async move { app.handle(stream, peer).await });
                    }
                    Err(e) => warn!(worker = index, error = %e, "accept failed"),
                }
            }
        });

        report_tx
            .send(WorkerMessage::Ready {
                id: self.index,
                port,
            })
            .map_err(|_| HiveError::Ipc("report channel closed".into()))?;

        let _ = self.started.send(info.clone());
        info!(
            worker = self.index,
            port,
            master = info.process_id,
            "worker started"
        );
        Ok(())
    }
}
