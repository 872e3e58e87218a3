//! Parent-side supervision of the synthesis worker.
//!
//! The worker is an opaque line-oriented service: spawn it lazily, write
//! request lines, read response lines until `eof`, and respawn within a
//! bounded budget when it dies. Closing its stdin is the graceful stop
//! signal (the worker contract is to exit on EOF); a hard kill follows
//! after a grace period.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::TtsError;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker executable and arguments.
    pub program: String,
    pub args: Vec<String>,
    /// Respawns tolerated within `restart_window` before giving up.
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Time allowed between stdin close and hard kill at shutdown.
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_restarts: 3,
            restart_window: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_restart_budget(mut self, max_restarts: u32, window: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_window = window;
        self
    }
}

struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<()>,
}

/// Owns the worker process exclusively; no other stage writes to it.
pub struct TtsSupervisor {
    config: SupervisorConfig,
    worker: Option<WorkerHandle>,
    restarts: VecDeque<Instant>,
}

impl TtsSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            worker: None,
            restarts: VecDeque::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Total respawns so far this session.
    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    /// Spawn the worker if it is not already up.
    pub async fn ensure_started(&mut self) -> Result<(), TtsError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TtsError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TtsError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TtsError::Protocol("worker stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TtsError::Protocol("worker stderr unavailable".into()))?;

        // Worker logs arrive on stderr; stdout is protocol only.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tts_worker", "{line}");
            }
        });

        info!(
            target: "tts",
            program = %self.config.program,
            "synthesis worker started"
        );

        self.worker = Some(WorkerHandle {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
        });
        Ok(())
    }

    /// Write one request line. The caller must then consume responses up
    /// to `eof` before the next request.
    pub async fn send_request(&mut self, request: &WorkerRequest) -> Result<(), TtsError> {
        let worker = self.worker.as_mut().ok_or(TtsError::ChildExit)?;
        let mut line = serde_json::to_vec(request)
            .map_err(|e| TtsError::Protocol(format!("unserializable request: {e}")))?;
        line.push(b'\n');
        worker.stdin.write_all(&line).await?;
        worker.stdin.flush().await?;
        Ok(())
    }

    /// Read the next response line. EOF on the worker's stdout means the
    /// process died mid-stream.
    pub async fn next_response(&mut self) -> Result<WorkerResponse, TtsError> {
        let worker = self.worker.as_mut().ok_or(TtsError::ChildExit)?;
        match worker.stdout.next_line().await? {
            Some(line) => serde_json::from_str(&line)
                .map_err(|e| TtsError::Protocol(format!("bad response line: {e}"))),
            None => Err(TtsError::ChildExit),
        }
    }

    /// Consume and discard responses until the current stream's `eof`,
    /// keeping the protocol framed after a cancellation.
    pub async fn drain_to_eof(&mut self) -> Result<(), TtsError> {
        loop {
            match self.next_response().await? {
                WorkerResponse::Eof => return Ok(()),
                other => debug!(target: "tts", discarded = other_tag(&other), "drained"),
            }
        }
    }

    /// Record a worker death and reap the process. Returns an error when
    /// the restart budget within the window is exhausted.
    pub async fn note_worker_death(&mut self) -> Result<(), TtsError> {
        if let Some(mut worker) = self.worker.take() {
            worker.stderr_task.abort();
            let _ = worker.child.start_kill();
            let _ = worker.child.wait().await;
        }

        let now = Instant::now();
        self.restarts.push_back(now);
        while let Some(front) = self.restarts.front() {
            if now.duration_since(*front) > self.config.restart_window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        let recent = self.restarts.len() as u32;
        if recent > self.config.max_restarts {
            warn!(
                target: "tts",
                recent,
                max = self.config.max_restarts,
                "worker restart budget exhausted"
            );
            return Err(TtsError::RestartBudget);
        }
        warn!(
            target: "tts",
            recent,
            max = self.config.max_restarts,
            "synthesis worker died, will respawn"
        );
        Ok(())
    }

    /// Graceful stop: close stdin, give the worker `kill_grace` to exit on
    /// EOF, then kill it.
    pub async fn shutdown(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        drop(worker.stdin);

        match tokio::time::timeout(self.config.kill_grace, worker.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "tts", %status, "worker exited");
            }
            Ok(Err(e)) => {
                warn!(target: "tts", "waiting for worker failed: {e}");
            }
            Err(_) => {
                warn!(target: "tts", "worker ignored EOF, killing");
                let _ = worker.child.start_kill();
                let _ = worker.child.wait().await;
            }
        }
        worker.stderr_task.abort();
    }
}

fn other_tag(resp: &WorkerResponse) -> &'static str {
    match resp {
        WorkerResponse::Started => "started",
        WorkerResponse::AudioChunk { .. } => "audio_chunk",
        WorkerResponse::Stopped => "stopped",
        WorkerResponse::Eof => "eof",
        WorkerResponse::Error { .. } => "error",
    }
}
