/// Sandbox host running as a child process.
///
/// The child reads newline-delimited JSON envelopes on stdin and writes
/// envelopes on stdout. Its stderr is inherited so snap diagnostics end up
/// in the host's log stream. One child hosts every job.
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ChannelTransport, Connection, EnvironmentFactory, TransportEvent, EVENT_QUEUE_CAPACITY};
use crate::config::EnvironmentConfig;
use crate::error::EnvironmentError;
use crate::protocol::Envelope;

pub struct ProcessEnvironment {
    config: EnvironmentConfig,
}

impl ProcessEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EnvironmentFactory for ProcessEnvironment {
    fn kind(&self) -> &str {
        "process"
    }

    /// Spawns the sandbox host and starts its read/write loop as a
    /// background task.
    async fn create(&self) -> Result<Connection, EnvironmentError> {
        if self.config.command.trim().is_empty() {
            return Err(EnvironmentError::Config(
                "sandbox host command is empty".into(),
            ));
        }

        info!(
            "Starting sandbox host: {} {}",
            self.config.command,
            self.config.args.join(" ")
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvironmentError::Spawn(format!("{}: {e}", self.config.command)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EnvironmentError::Unavailable("failed to capture sandbox host stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EnvironmentError::Unavailable("failed to capture sandbox host stdout".into())
        })?;

        if let Some(pid) = child.id() {
            info!("Sandbox host running (pid {pid})");
        }

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE_CAPACITY);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Envelope>();

        tokio::spawn(run_event_loop(child, stdout, stdin, event_tx, write_rx));

        Ok(Connection {
            transport: Arc::new(ChannelTransport::new(write_tx)),
            events: event_rx,
        })
    }
}

/// Main read/write loop. Ends when either direction fails or the host
/// closes the transport; the child is then killed and a `Closed` event
/// is emitted.
async fn run_event_loop(
    mut child: Child,
    stdout: ChildStdout,
    stdin: ChildStdin,
    event_tx: mpsc::Sender<TransportEvent>,
    mut write_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    // Read task
    let event_tx_clone = event_tx.clone();
    let mut read_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => {
                            debug!("Received from job {}", envelope.job_id);
                            if event_tx_clone
                                .send(TransportEvent::Message(envelope))
                                .await
                                .is_err()
                            {
                                return "event receiver dropped".to_string();
                            }
                        }
                        // A bad line never takes the transport down.
                        Err(e) => warn!("Dropping unparseable line from sandbox host: {e}"),
                    }
                }
                Ok(None) => {
                    warn!("Sandbox host closed its output");
                    return "sandbox host closed its output".to_string();
                }
                Err(e) => {
                    error!("Read error: {e}");
                    return format!("read error: {e}");
                }
            }
        }
    });

    // Write task
    let mut write_handle = tokio::spawn(async move {
        let mut writer = stdin;
        while let Some(envelope) = write_rx.recv().await {
            let mut line = match serde_json::to_string(&envelope) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode envelope for job {}: {e}", envelope.job_id);
                    continue;
                }
            };
            line.push('\n');

            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!("Write error: {e}");
                return format!("write error: {e}");
            }
            if let Err(e) = writer.flush().await {
                error!("Flush error: {e}");
                return format!("write error: {e}");
            }
            debug!("Sent to job {}", envelope.job_id);
        }
        "transport closed by host".to_string()
    });

    let reason = tokio::select! {
        result = &mut read_handle => result.unwrap_or_else(|e| format!("reader task failed: {e}")),
        result = &mut write_handle => result.unwrap_or_else(|e| format!("writer task failed: {e}")),
    };
    read_handle.abort();
    write_handle.abort();

    if let Err(e) = child.kill().await {
        debug!("Sandbox host already gone: {e}");
    }
    info!("Sandbox host stopped: {reason}");

    let _ = event_tx.send(TransportEvent::Closed(reason)).await;
}
