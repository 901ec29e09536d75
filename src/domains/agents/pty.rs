use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, watch};

use crate::shared::process::{ProcessExit, ProcessHandle, signal_process};

const READ_CHUNK_BYTES: usize = 8192;
const DEFAULT_ROWS: u16 = 40;
const DEFAULT_COLS: u16 = 200;

/// Everything needed to start one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub session_id: String,
    pub worktree_path: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

pub struct LaunchedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    /// Raw output chunks; closed once the process stops writing.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedProcess>;
}

/// Starts agents inside a pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    size: PtySize,
}

impl Default for PtyLauncher {
    fn default() -> Self {
        Self {
            size: PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl PtyLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

struct PtyProcess {
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Dropping the master hangs up the child.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.has_exited() {
            return Err(anyhow!("process has exited"));
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("pty writer lock poisoned"))?;
        writer.write_all(data).context("Failed to write to pty")?;
        writer.flush().context("Failed to flush pty")
    }

    fn kill(&self) -> Result<()> {
        if let Some(pid) = self.pid {
            return signal_process(pid, nix::sys::signal::Signal::SIGKILL);
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| anyhow!("pty killer lock poisoned"))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(anyhow!("Failed to kill pty child: {e}")),
        }
    }

    fn on_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }
}

fn resolve_program(program: &str) -> PathBuf {
    match which::which(program) {
        Ok(path) => path,
        Err(e) => {
            debug!("Could not resolve '{program}' on PATH ({e}); using it as given");
            PathBuf::from(program)
        }
    }
}

#[async_trait]
impl AgentLauncher for PtyLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedProcess> {
        if !request.worktree_path.is_dir() {
            return Err(anyhow!(
                "Worktree {} does not exist",
                request.worktree_path.display()
            ));
        }

        let pair = native_pty_system()
            .openpty(self.size)
            .map_err(|e| anyhow!("Failed to open pty: {e}"))?;

        let program = resolve_program(&request.program);
        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&request.args);
        cmd.cwd(&request.worktree_path);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("Failed to spawn {}: {e}", program.display()))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("Failed to clone pty reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("Failed to take pty writer: {e}"))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let session_id = request.session_id.clone();

        thread::Builder::new()
            .name(format!("grove-pty-{session_id}"))
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        // EIO is how Linux reports a hung-up pty.
                        Err(_) => break,
                    }
                }
                drop(output_tx);

                let exit = match child.wait() {
                    Ok(status) => ProcessExit {
                        exit_code: i32::try_from(status.exit_code()).ok(),
                        signal: status.signal().map(str::to_string),
                    },
                    Err(e) => {
                        warn!("Failed to wait for agent of session {session_id}: {e}");
                        ProcessExit::default()
                    }
                };
                exit_tx.send_replace(Some(exit));
            })
            .context("Failed to spawn pty reader thread")?;

        info!(
            "Spawned {} for session {} in {} (pid {pid:?})",
            program.display(),
            request.session_id,
            request.worktree_path.display()
        );

        Ok(LaunchedProcess {
            handle: Arc::new(PtyProcess {
                pid,
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
                _master: Mutex::new(pair.master),
                exit_rx,
            }),
            output: output_rx,
        })
    }
}
