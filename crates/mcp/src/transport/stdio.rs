//! Child-process transport.
//!
//! Spawns the configured command with piped stdio. Requests are written to
//! stdin as newline-terminated JSON; stdout is split into lines and each
//! line is routed to the pending table. Stderr is only logged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::error::McpError;
use crate::pending::PendingTable;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

use super::framing::LineBuffer;
use super::{encode_frame, Transport};

/// How long `disconnect` waits for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Command line and environment for a server process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

struct Pipe {
    stdin: ChildStdin,
    /// A write was cancelled part-way and may have left half a line behind.
    torn: bool,
}

struct Running {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

/// Transport over a spawned child process's stdin/stdout.
pub struct StdioTransport {
    process: ProcessSpec,
    table: Arc<PendingTable>,
    writer: Mutex<Option<Pipe>>,
    running: Mutex<Option<Running>>,
    connect_lock: Mutex<()>,
}

impl StdioTransport {
    pub fn new(
        server: &str,
        process: ProcessSpec,
        codec: Arc<MessageCodec>,
        timeout: Duration,
    ) -> Self {
        Self {
            process,
            table: Arc::new(PendingTable::new(server, codec, timeout)),
            writer: Mutex::new(None),
            running: Mutex::new(None),
            connect_lock: Mutex::new(()),
        }
    }

    fn spawn(&self) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), McpError> {
        let server = self.table.server();
        info!(server = %server, command = %self.process.command, args = ?self.process.args, "spawning MCP server process");

        let mut cmd = Command::new(&self.process.command);
        cmd.args(&self.process.args)
            .envs(&self.process.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.process.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection(server, format!("failed to spawn `{}`: {e}", self.process.command))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        match (stdin, stdout, stderr) {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok((child, stdin, stdout, stderr)),
            _ => {
                let _ = child.start_kill();
                Err(McpError::connection(server, "failed to capture child stdio"))
            }
        }
    }

    async fn write(&self, frame: String) -> Result<(), McpError> {
        let server = self.table.server();
        let mut guard = self.writer.lock().await;
        let pipe = guard.as_mut().ok_or_else(|| McpError::closed(server))?;

        let mut line = Vec::with_capacity(frame.len() + 2);
        if pipe.torn {
            // Terminate the partial line so the next frame starts clean.
            line.push(b'\n');
        }
        line.extend_from_slice(frame.as_bytes());
        line.push(b'\n');

        pipe.torn = true;
        pipe.stdin
            .write_all(&line)
            .await
            .map_err(|e| McpError::send(server, format!("failed to write to stdin: {e}")))?;
        pipe.stdin
            .flush()
            .await
            .map_err(|e| McpError::send(server, format!("failed to flush stdin: {e}")))?;
        pipe.torn = false;
        Ok(())
    }
}

/// Read stdout until EOF, routing every complete line.
async fn pump_stdout(table: Arc<PendingTable>, mut stdout: ChildStdout) {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                if let Some(rest) = lines.take_remainder() {
                    table.handle_incoming(&rest);
                }
                info!(server = %table.server(), "server stdout closed (process exited)");
                break;
            }
            Ok(n) => {
                for frame in lines.frames(&chunk[..n]) {
                    table.handle_incoming(&frame);
                }
            }
            Err(e) => {
                warn!(server = %table.server(), error = %e, "stdout read error");
                break;
            }
        }
    }
    table.cleanup();
}

/// Surface stderr as diagnostics only.
async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    debug!(server = %server, "[stderr] {}", trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(server = %server, error = %e, "stderr read error");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn server_name(&self) -> &str {
        self.table.server()
    }

    async fn connect(&self) -> Result<(), McpError> {
        let _serial = self.connect_lock.lock().await;
        if !self.table.begin_connect()? {
            return Ok(());
        }

        let (child, stdin, stdout, stderr) = match self.spawn() {
            Ok(parts) => parts,
            Err(e) => {
                self.table.fail_connect();
                return Err(e);
            }
        };

        *self.writer.lock().await = Some(Pipe { stdin, torn: false });
        let tasks = vec![
            tokio::spawn(pump_stdout(Arc::clone(&self.table), stdout)),
            tokio::spawn(drain_stderr(self.table.server().to_string(), stderr)),
        ];
        *self.running.lock().await = Some(Running { child, tasks });

        if let Err(e) = self.table.mark_connected() {
            self.disconnect().await?;
            return Err(e);
        }
        info!(server = %self.table.server(), "stdio transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.table.cleanup();

        // Kill first: a write blocked on a full pipe holds the writer lock
        // until the pipe breaks.
        let running = self.running.lock().await.take();
        if let Some(mut running) = running {
            if let Err(e) = running.child.start_kill() {
                debug!(server = %self.table.server(), error = %e, "kill failed (process already exited?)");
            }
            match tokio::time::timeout(KILL_GRACE, running.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(server = %self.table.server(), %status, "server process terminated");
                }
                Ok(Err(e)) => {
                    warn!(server = %self.table.server(), error = %e, "failed to reap server process");
                }
                Err(_) => {
                    warn!(server = %self.table.server(), "server process did not exit in time");
                }
            }
            for task in running.tasks {
                task.abort();
            }
        }

        self.writer.lock().await.take();
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let frame = encode_frame(self.table.server(), &request)?;
        self.table.exchange(&request, self.write(frame)).await
    }

    async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> Result<(), McpError> {
        if !self.table.is_connected() {
            return Err(McpError::closed(self.table.server()));
        }
        let frame = encode_frame(self.table.server(), &notification)?;
        self.table
            .bounded(&notification.method, self.write(frame))
            .await
    }

    fn is_connected(&self) -> bool {
        self.table.is_connected()
    }
}
