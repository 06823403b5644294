use crate::config::{SessionConfig, DOCKER_HOST_ENV};
use crate::error::{DocklogError, Result};
use crate::logs::line::split_timestamp;
use crate::logs::{LineSplitter, LiveStream, LogLine, LogSource};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 8192;
const LIVE_CHANNEL_CAPACITY: usize = 64;

/// `LogSource` backed by the `docker` command-line client
///
/// Every request runs `docker` with `--timestamps` so each line carries
/// the time the daemon recorded it. Stderr lines without a timestamp are
/// the client's own diagnostics and are used to classify failures.
///
/// The tail and the live stream are two separate client runs. Each tail
/// fetch records where it stopped, and the following `subscribe` resumes
/// from there with `--since`, dropping lines the tail already returned.
#[derive(Debug, Clone)]
pub struct DockerCliSource {
    binary: PathBuf,
    host: String,
    resume_points: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl DockerCliSource {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            binary: config.docker_binary.clone(),
            host: config.daemon_host(),
            resume_points: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Daemon address passed to the client
    pub fn host(&self) -> &str {
        &self.host
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .env(DOCKER_HOST_ENV, &self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn record_resume_point(&self, identity: &str, at: DateTime<Utc>) {
        if let Ok(mut points) = self.resume_points.lock() {
            points.insert(identity.to_string(), at);
        }
    }

    fn take_resume_point(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.resume_points
            .lock()
            .ok()
            .and_then(|mut points| points.remove(identity))
    }

    fn spawn_error(&self, e: std::io::Error) -> DocklogError {
        DocklogError::ConnectionError(format!(
            "failed to run {}: {}",
            self.binary.display(),
            e
        ))
    }
}

#[async_trait]
impl LogSource for DockerCliSource {
    async fn resolve(&self, identity: &str) -> Result<String> {
        let output = self
            .command()
            .args(["inspect", "--type", "container", "--format", "{{.Name}}", "--", identity])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(classify_failure(
                identity,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        let name = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_start_matches('/')
            .to_string();
        debug!(identity, name = %name, "Resolved container");

        if name.is_empty() {
            Ok(identity.to_string())
        } else {
            Ok(name)
        }
    }

    async fn fetch_tail(&self, identity: &str, count: usize) -> Result<Vec<LogLine>> {
        let requested_at = Utc::now();
        let count = count.to_string();
        let output = self
            .command()
            .args(["logs", "--timestamps", "--tail", count.as_str(), "--", identity])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let mut lines = split_all(identity, &output.stdout);
        let mut diagnostics = Vec::new();
        for line in split_all(identity, &output.stderr) {
            if line.timestamp.is_some() {
                lines.push(line);
            } else {
                diagnostics.push(line.payload);
            }
        }

        if !output.status.success() {
            return Err(classify_failure(identity, &diagnostics.join("\n")));
        }

        // stdout and stderr arrive on separate pipes; the timestamps restore their order
        lines.sort_by_key(|line| line.timestamp);
        debug!(identity, count = lines.len(), "Fetched log tail");

        let last_seen = lines.iter().filter_map(|line| line.timestamp).max();
        self.record_resume_point(identity, last_seen.unwrap_or(requested_at));

        Ok(lines)
    }

    async fn subscribe(&self, identity: &str, cancel: CancellationToken) -> Result<LiveStream> {
        let resume_after = self.take_resume_point(identity);

        let mut command = self.command();
        command.args(["logs", "--follow", "--timestamps"]);
        match resume_after {
            Some(at) => {
                debug!(identity, since = %at, "Resuming after log tail");
                let since = at.to_rfc3339_opts(SecondsFormat::Nanos, true);
                command.args(["--since", since.as_str()]);
            }
            None => {
                command.args(["--tail", "0"]);
            }
        }
        let mut child = command
            .args(["--", identity])
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            DocklogError::Other(format!("No stdout pipe available for {}", identity))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            DocklogError::Other(format!("No stderr pipe available for {}", identity))
        })?;

        let (tx, mut stream) = LiveStream::channel(LIVE_CHANNEL_CAPACITY);
        let identity = identity.to_string();

        let task = tokio::spawn(async move {
            let diagnostics = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(identity = %identity, "Follow canceled, stopping docker client");
                    let _ = child.kill().await;
                    return;
                }
                diagnostics = pump_pipes(stdout, stderr, resume_after, &tx) => diagnostics,
            };

            let Some(diagnostics) = diagnostics else {
                // Receiver went away; kill_on_drop reaps the child
                return;
            };

            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status,
            };

            match status {
                Ok(status) if status.success() => {
                    debug!(identity = %identity, "Container log stream closed");
                }
                Ok(_) if cancel.is_cancelled() => {}
                Ok(status) if status.code().is_none() => {
                    // Stopped by a signal (Ctrl-C reaches the client too)
                    debug!(identity = %identity, "Docker client terminated by signal");
                }
                Ok(_) => {
                    let _ = tx
                        .send(Err(classify_failure(&identity, &diagnostics.join("\n"))))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(DocklogError::ConnectionError(format!(
                            "lost docker client for {}: {}",
                            identity, e
                        ))))
                        .await;
                }
            }
        });
        stream.attach_task(task);

        Ok(stream)
    }
}

/// Forward complete lines from both pipes until both close
///
/// Each pipe has its own splitter so a partial stdout line can never be
/// completed by stderr bytes. Lines stamped at or before `resume_after`
/// were already delivered by the tail and are skipped. Returns the
/// collected diagnostics, or `None` when the receiver was dropped.
async fn pump_pipes<O, E>(
    mut stdout: O,
    mut stderr: E,
    resume_after: Option<DateTime<Utc>>,
    tx: &mpsc::Sender<Result<Vec<u8>>>,
) -> Option<Vec<String>>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_splitter = LineSplitter::new();
    let mut err_splitter = LineSplitter::new();
    let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut err_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut diagnostics = Vec::new();

    while stdout_open || stderr_open {
        let (lines, from_stderr): (Vec<String>, bool) = tokio::select! {
            read = stdout.read(&mut out_buf), if stdout_open => match read {
                Ok(0) | Err(_) => {
                    stdout_open = false;
                    (out_splitter.finish().into_iter().collect(), false)
                }
                Ok(n) => (out_splitter.push(&out_buf[..n]), false),
            },
            read = stderr.read(&mut err_buf), if stderr_open => match read {
                Ok(0) | Err(_) => {
                    stderr_open = false;
                    (err_splitter.finish().into_iter().collect(), true)
                }
                Ok(n) => (err_splitter.push(&err_buf[..n]), true),
            },
        };

        for line in lines {
            let timestamp = split_timestamp(&line).0;
            if from_stderr && timestamp.is_none() {
                diagnostics.push(line);
                continue;
            }
            if matches!((timestamp, resume_after), (Some(ts), Some(after)) if ts <= after) {
                continue;
            }

            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if tx.send(Ok(bytes)).await.is_err() {
                return None;
            }
        }
    }

    Some(diagnostics)
}

fn split_all(identity: &str, bytes: &[u8]) -> Vec<LogLine> {
    let mut splitter = LineSplitter::new();
    let mut raw = splitter.push(bytes);
    raw.extend(splitter.finish());
    raw.into_iter()
        .map(|line| LogLine::parse(identity, &line))
        .collect()
}

/// Map docker client diagnostics onto the session error taxonomy
pub fn classify_failure(identity: &str, diagnostics: &str) -> DocklogError {
    let lowered = diagnostics.to_lowercase();

    if lowered.contains("no such container") || lowered.contains("no such object") {
        return DocklogError::NotFound(identity.to_string());
    }

    let detail = diagnostics
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("docker client exited with an error")
        .trim()
        .to_string();

    DocklogError::ConnectionError(detail)
}
