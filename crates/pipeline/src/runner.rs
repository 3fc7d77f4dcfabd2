//! Subprocess lifecycle management for the pipeline executable.
//!
//! [`SubprocessRunner`] spawns the external pipeline with an isolated
//! environment, streams its combined stdout/stderr line by line, feeds
//! the progress protocol, and enforces the wall-clock timeout with a
//! watchdog that does not depend on the child cooperating. Termination
//! is SIGTERM first, SIGKILL after a grace period; `kill_on_drop` backs
//! both up if the runner itself is dropped mid-run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tabsyn_core::job::{Stage, Tier};

use crate::error::ExecutionError;
use crate::params::RunParams;
use crate::protocol::ProgressTracker;

/// Log lines retained by the runner for failure classification.
const TAIL_LINES: usize = 40;

/// Buffer size for the internal line channel.
const LINE_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Static configuration for the subprocess runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interpreter used to launch the pipeline entry point.
    pub python_bin: PathBuf,
    /// The pipeline entry point script.
    pub script_path: PathBuf,
    /// Working directory for the child process.
    pub working_dir: PathBuf,
    /// Root of the pipeline data layout; output artifacts are resolved
    /// relative to this directory.
    pub data_root: PathBuf,
    /// Value for `PYTHONPATH`, when the pipeline needs its own sources
    /// importable.
    pub pythonpath: Option<PathBuf>,
    /// Hard wall-clock limit for one run.
    pub timeout: Duration,
    /// How long to wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// `CUDA_VISIBLE_DEVICES` value for GPU-tier runs. CPU-tier runs
    /// always get an empty device list.
    pub gpu_devices: String,
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Progress emitted while a run is in flight.
#[derive(Debug)]
pub enum ProgressEvent {
    /// One verbatim output line, to be appended to the job log.
    Line(String),
    /// The progress protocol advanced.
    Progress { stage: Stage, percent: u8 },
}

/// One execution attempt.
pub struct RunRequest {
    pub token: String,
    pub params: RunParams,
    pub tier: Tier,
    /// Cooperative cancellation, checked by the output loop.
    pub cancel: CancellationToken,
    /// Sink for log lines and progress updates.
    pub progress: mpsc::Sender<ProgressEvent>,
}

/// Successful run result.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub exit_code: i32,
    /// Path of the produced artifact.
    pub result_ref: String,
    pub duration: Duration,
}

/// Seam between the worker and the process boundary. Tests substitute
/// deterministic runners; production uses [`SubprocessRunner`].
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<PipelineOutcome, ExecutionError>;
}

// ---------------------------------------------------------------------------
// SubprocessRunner
// ---------------------------------------------------------------------------

pub struct SubprocessRunner {
    config: RunnerConfig,
}

impl SubprocessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, params: &RunParams, tier: Tier) -> Command {
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg(&self.config.script_path)
            .args(params.to_args())
            .current_dir(&self.config.working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(pythonpath) = &self.config.pythonpath {
            cmd.env("PYTHONPATH", pythonpath);
        }

        // Device visibility is decided by the lane, never by the job.
        let devices = match tier {
            Tier::Cpu => "",
            Tier::Gpu => self.config.gpu_devices.as_str(),
        };
        cmd.env("CUDA_VISIBLE_DEVICES", devices);

        cmd
    }
}

#[async_trait]
impl PipelineRunner for SubprocessRunner {
    async fn run(&self, request: RunRequest) -> Result<PipelineOutcome, ExecutionError> {
        let start = Instant::now();
        let cancel = request.cancel.clone();
        let progress = request.progress.clone();

        let mut child = self
            .build_command(&request.params, request.tier)
            .spawn()?;

        tracing::info!(
            token = %request.token,
            tier = %request.tier,
            dataset = %request.params.dataset,
            "Pipeline subprocess spawned",
        );

        // Merge stdout and stderr into one line stream.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
        tokio::spawn(forward_lines(stderr, line_tx));

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let mut tracker = ProgressTracker::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

        // Output loop: runs until both stream halves close (the child is
        // exiting), the watchdog fires, or cancellation is requested.
        loop {
            tokio::select! {
                maybe_line = line_rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            if tail.len() == TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.clone());

                            if let Some((stage, percent)) = tracker.observe(&line) {
                                let _ = progress
                                    .send(ProgressEvent::Progress { stage, percent })
                                    .await;
                            }
                            let _ = progress.send(ProgressEvent::Line(line)).await;
                        }
                        None => break,
                    }
                }
                () = cancel.cancelled() => {
                    tracing::info!(token = %request.token, "Cancellation requested, terminating pipeline");
                    terminate(&mut child, self.config.kill_grace).await;
                    return Err(ExecutionError::Canceled);
                }
                () = &mut deadline => {
                    tracing::warn!(
                        token = %request.token,
                        timeout_secs = self.config.timeout.as_secs(),
                        "Pipeline exceeded wall-clock timeout, terminating",
                    );
                    terminate(&mut child, self.config.kill_grace).await;
                    return Err(ExecutionError::Timeout {
                        elapsed_secs: start.elapsed().as_secs(),
                    });
                }
            }
        }

        // Streams are closed; the watchdog and cancellation still apply
        // while waiting for the exit status.
        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                terminate(&mut child, self.config.kill_grace).await;
                return Err(ExecutionError::Canceled);
            }
            () = &mut deadline => {
                terminate(&mut child, self.config.kill_grace).await;
                return Err(ExecutionError::Timeout {
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(ExecutionError::Exit {
                exit_code,
                log_tail: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            });
        }

        let output_path = self.config.data_root.join(request.params.output_relpath());
        if tokio::fs::metadata(&output_path).await.is_err() {
            return Err(ExecutionError::MissingOutput {
                path: output_path.display().to_string(),
            });
        }

        tracing::info!(
            token = %request.token,
            exit_code,
            duration_secs = start.elapsed().as_secs(),
            "Pipeline subprocess finished",
        );

        Ok(PipelineOutcome {
            exit_code,
            result_ref: output_path.display().to_string(),
            duration: start.elapsed(),
        })
    }
}

/// Forward every line of an output stream into the merged channel.
async fn forward_lines<R: AsyncRead + Unpin + Send + 'static>(
    stream: Option<R>,
    tx: mpsc::Sender<String>,
) {
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            return;
        }
    }
}

/// Terminate the child: SIGTERM, then SIGKILL after the grace period.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
