//! Engine process lifecycle manager.
//!
//! Supervises the proxy engine binary as a child process: spawn, runtime
//! config handoff via stdin, readiness detection, log tailing, shutdown.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

/// How many recent log lines the rolling buffer retains.
const LOG_BUFFER_LINES: usize = 128;

/// Capacity of the live log subscription channel.
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Errors from engine process operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("failed to spawn engine: {0}")]
    Spawn(String),

    #[error("engine failed to start: {last_log}")]
    Startup { last_log: String },
}

/// Strategy for deciding the engine has finished starting.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Probe the engine's control API port with backoff until it accepts
    /// connections. Decouples startup detection from the engine's log
    /// format.
    ApiProbe { port: u16, deadline: Duration },
    /// Watch stdout for a marker line. For engines without a control API,
    /// and for tests.
    LogMarker { marker: String, deadline: Duration },
}

impl Readiness {
    const fn deadline(&self) -> Duration {
        match self {
            Self::ApiProbe { deadline, .. } | Self::LogMarker { deadline, .. } => *deadline,
        }
    }
}

/// Supervisor for the local engine child process.
///
/// States: stopped -> started -> stopped. The process handle is only
/// stored once readiness is confirmed; a failed startup leaves the
/// supervisor stopped.
pub struct EngineProcess {
    binary: PathBuf,
    args: Vec<String>,
    readiness: Readiness,
    child: Mutex<Option<Child>>,
    started: AtomicBool,
    logs: Arc<Mutex<VecDeque<String>>>,
    log_tx: broadcast::Sender<String>,
    terminate_timeout: Duration,
}

impl EngineProcess {
    pub fn new(binary: PathBuf, args: Vec<String>, readiness: Readiness) -> Self {
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            binary,
            args,
            readiness,
            child: Mutex::new(None),
            started: AtomicBool::new(false),
            logs: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_BUFFER_LINES))),
            log_tx,
            terminate_timeout: Duration::from_secs(5),
        }
    }

    /// Whether the engine is confirmed running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Subscribe to live log lines. Multiple viewers can subscribe without
    /// contending for the process's single output stream.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    /// Snapshot of the rolling log buffer.
    pub async fn recent_logs(&self) -> Vec<String> {
        self.logs.lock().await.iter().cloned().collect()
    }

    async fn last_log(&self) -> String {
        self.logs
            .lock()
            .await
            .back()
            .cloned()
            .unwrap_or_else(|| "(no output)".into())
    }

    /// Start the engine with the given serialized runtime config.
    ///
    /// Spawns the binary, writes the config to its stdin, closes it, then
    /// waits for readiness. The handle is stored (and `started` set) only
    /// on success; a child that exits before becoming ready yields
    /// [`EngineError::Startup`] carrying the last log line.
    pub async fn start(&self, runtime_config: &str) -> Result<(), EngineError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        info!(binary = %self.binary.display(), "Starting engine");
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let Some(mut stdin) = child.stdin.take() else {
            child.kill().await.ok();
            return Err(EngineError::Spawn("failed to capture stdin".into()));
        };
        let handoff = async {
            stdin.write_all(runtime_config.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = handoff {
            // The child is already running; reap it before reporting the
            // failed handoff, nothing retains the handle after this return.
            child.kill().await.ok();
            return Err(EngineError::Spawn(e.to_string()));
        }
        drop(stdin); // EOF tells the engine the config document is complete

        // Subscribe before the readers start so no line is missed.
        let mut ready_rx = self.log_tx.subscribe();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("failed to capture stdout".into()))?;
        spawn_line_reader(stdout, Arc::clone(&self.logs), self.log_tx.clone());
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, Arc::clone(&self.logs), self.log_tx.clone());
        }

        let ready = match &self.readiness {
            Readiness::LogMarker { marker, deadline } => {
                self.await_log_marker(&mut child, &mut ready_rx, marker, *deadline)
                    .await
            }
            Readiness::ApiProbe { port, deadline } => {
                self.await_api_probe(&mut child, *port, *deadline).await
            }
        };

        match ready {
            Ok(()) => {
                *slot = Some(child);
                self.started.store(true, Ordering::SeqCst);
                info!("Engine started");
                Ok(())
            }
            Err(e) => {
                child.kill().await.ok();
                Err(e)
            }
        }
    }

    async fn await_log_marker(
        &self,
        child: &mut Child,
        lines: &mut broadcast::Receiver<String>,
        marker: &str,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let marker_seen = async {
            loop {
                match lines.recv().await {
                    Ok(line) if line.contains(marker) => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        let wait = async {
            tokio::select! {
                () = marker_seen => Ok(()),
                status = child.wait() => {
                    // Exited before reporting ready. Give the reader tasks a
                    // moment to flush the final lines into the buffer.
                    debug!(?status, "Engine exited before becoming ready");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(EngineError::Startup {
                        last_log: self.last_log().await,
                    })
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?deadline, "Engine readiness marker not seen before deadline");
                let _ = child.start_kill();
                Err(EngineError::Startup {
                    last_log: self.last_log().await,
                })
            }
        }
    }

    async fn await_api_probe(
        &self,
        child: &mut Child,
        port: u16,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        let started = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(100);

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(?status, "Engine exited before becoming ready");
                return Err(EngineError::Startup {
                    last_log: self.last_log().await,
                });
            }
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                warn!(port, ?deadline, "Engine control API never became reachable");
                return Err(EngineError::Startup {
                    last_log: self.last_log().await,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    /// Stop the engine, killing the process if it does not exit within the
    /// terminate timeout.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut slot = self.child.lock().await;
        let mut child = slot.take().ok_or(EngineError::NotRunning)?;
        self.started.store(false, Ordering::SeqCst);

        let _ = child.start_kill();
        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Engine stopped");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for engine to exit");
            }
            Err(_) => {
                warn!("Timeout waiting for engine to exit, killing");
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    /// Whether the supervised child is still running. A child observed to
    /// have exited clears the stored handle and the started flag.
    pub async fn is_alive(&self) -> bool {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(?status, "Engine exited unexpectedly");
                *slot = None;
                self.started.store(false, Ordering::SeqCst);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Failed to poll engine process");
                true
            }
        }
    }

    /// Stop (if running) and start with a fresh runtime config.
    pub async fn restart(&self, runtime_config: &str) -> Result<(), EngineError> {
        match self.stop().await {
            Ok(()) | Err(EngineError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.start(runtime_config).await
    }
}

fn spawn_line_reader<R>(
    stream: R,
    logs: Arc<Mutex<VecDeque<String>>>,
    tx: broadcast::Sender<String>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(stream);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "engine", "{}", line);
            {
                let mut buffer = logs.lock().await;
                if buffer.len() == LOG_BUFFER_LINES {
                    buffer.pop_front();
                }
                buffer.push_back(line.clone());
            }
            // No receivers is fine; the buffer still records the line.
            let _ = tx.send(line);
        }
    });
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn fake_engine(script_body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{script_body}").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    fn marker_readiness() -> Readiness {
        Readiness::LogMarker {
            marker: "engine started".into(),
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn start_waits_for_marker_then_stop() {
        // Consumes the config from stdin, reports ready, then idles.
        let (_dir, path) = fake_engine(
            "while read line; do :; done\necho 'core: engine started'\nsleep 30",
        );
        let engine = EngineProcess::new(path, vec![], marker_readiness());

        engine.start("{}").await.unwrap();
        assert!(engine.is_started());

        engine.stop().await.unwrap();
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn premature_exit_reports_last_log_line() {
        let (_dir, path) = fake_engine("echo 'config rejected: bad inbound'\nexit 1");
        let engine = EngineProcess::new(path, vec![], marker_readiness());

        match engine.start("{}").await {
            Err(EngineError::Startup { last_log }) => {
                assert_eq!(last_log, "config rejected: bad inbound");
            }
            other => panic!("expected Startup error, got {other:?}"),
        }
        assert!(!engine.is_started());
    }

    #[tokio::test]
    async fn failed_config_handoff_reaps_the_child() {
        // Records its pid, closes stdin without reading the config, then
        // idles. The oversized write hits a broken pipe and the spawned
        // child must not be left running afterwards.
        let (_dir, path) = fake_engine("echo $$ > \"$0.pid\"\nexec 0<&-\nsleep 30");
        let pid_file = format!("{}.pid", path.display());
        let engine = EngineProcess::new(path, vec![], marker_readiness());

        let config = "x".repeat(1 << 20);
        assert!(matches!(
            engine.start(&config).await,
            Err(EngineError::Spawn(_))
        ));
        assert!(!engine.is_started());
        assert!(!engine.is_alive().await);

        // The pid file is written before stdin closes, so it exists by the
        // time the handoff can fail.
        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_owned();
        let alive = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("kill -0 {pid}"))
            .status()
            .unwrap()
            .success();
        assert!(!alive);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (_dir, path) = fake_engine(
            "while read line; do :; done\necho 'engine started'\nsleep 30",
        );
        let engine = EngineProcess::new(path, vec![], marker_readiness());

        engine.start("{}").await.unwrap();
        assert!(matches!(
            engine.start("{}").await,
            Err(EngineError::AlreadyRunning)
        ));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_not_running() {
        let (_dir, path) = fake_engine("exit 0");
        let engine = EngineProcess::new(path, vec![], marker_readiness());
        assert!(matches!(engine.stop().await, Err(EngineError::NotRunning)));
    }

    #[tokio::test]
    async fn log_subscription_and_buffer_observe_output() {
        let (_dir, path) = fake_engine(
            "while read line; do :; done\necho 'warmup line'\necho 'engine started'\nsleep 30",
        );
        let engine = EngineProcess::new(path, vec![], marker_readiness());

        let mut logs = engine.subscribe_logs();
        engine.start("{}").await.unwrap();

        let first = logs.recv().await.unwrap();
        assert_eq!(first, "warmup line");

        let recent = engine.recent_logs().await;
        assert!(recent.iter().any(|l| l.contains("engine started")));

        engine.stop().await.unwrap();
    }
}
