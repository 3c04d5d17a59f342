//! Local ComfyUI process management.
//!
//! Starts an installed ComfyUI (`main.py`) as a child process, forwards its
//! output to `tracing`, and stops it on shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// ComfyUI checkout containing `main.py`.
    pub comfyui_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Virtualenv to run from; defaults to `<comfyui_dir>/venv`.
    pub venv_dir: Option<PathBuf>,
    /// Extra command-line arguments, split on whitespace.
    pub extra_args: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("ComfyUI installation not found: {0}")]
    NotInstalled(String),

    #[error("Failed to spawn ComfyUI: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle to a launched ComfyUI process.
pub struct Launcher {
    config: LauncherConfig,
    child: Option<Child>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            child: None,
            log_tasks: Vec::new(),
        }
    }

    /// Check that `main.py` exists in the configured directory.
    pub fn validate_installation(&self) -> Result<(), LauncherError> {
        let dir = &self.config.comfyui_dir;
        if !dir.is_dir() {
            return Err(LauncherError::NotInstalled(format!(
                "directory {} does not exist",
                dir.display()
            )));
        }
        let main_py = dir.join("main.py");
        if !main_py.is_file() {
            return Err(LauncherError::NotInstalled(format!(
                "{} is missing",
                main_py.display()
            )));
        }
        Ok(())
    }

    /// Interpreter inside the venv if present, else `python3` from `PATH`.
    pub fn python_executable(&self) -> PathBuf {
        let venv = self
            .config
            .venv_dir
            .clone()
            .unwrap_or_else(|| self.config.comfyui_dir.join("venv"));
        let candidate = if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        };

        if candidate.is_file() {
            candidate
        } else {
            tracing::warn!(venv = %venv.display(), "Venv interpreter not found, using system python3");
            PathBuf::from("python3")
        }
    }

    /// Arguments passed to the interpreter.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            self.config.comfyui_dir.join("main.py").display().to_string(),
            "--listen".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
        ];
        args.extend(self.config.extra_args.split_whitespace().map(str::to_string));
        args
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the process. A no-op when it is already running.
    pub fn start(&mut self) -> Result<(), LauncherError> {
        self.validate_installation()?;

        if self.is_running() {
            tracing::warn!("ComfyUI is already running");
            return Ok(());
        }

        let python = self.python_executable();
        let args = self.command_args();
        tracing::info!(python = %python.display(), args = ?args, "Starting ComfyUI");

        let mut child = Command::new(&python)
            .args(&args)
            .current_dir(&self.config.comfyui_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            self.log_tasks.push(tokio::spawn(forward_lines(stdout, false)));
        }
        if let Some(stderr) = child.stderr.take() {
            self.log_tasks.push(tokio::spawn(forward_lines(stderr, true)));
        }

        tracing::info!(pid = ?child.id(), "ComfyUI process started");
        self.child = Some(child);
        Ok(())
    }

    /// Stop the process, killing it if it has not exited within `grace`.
    pub async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            tracing::info!("ComfyUI is not running");
            return;
        };

        tracing::info!("Stopping ComfyUI");
        terminate(&mut child).await;

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "ComfyUI stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to wait for ComfyUI"),
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "ComfyUI did not stop in time, killing");
                if let Err(e) = child.kill().await {
                    tracing::error!(error = %e, "Failed to kill ComfyUI");
                }
            }
        }

        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Ask the child to exit: SIGTERM on Unix, immediate kill elsewhere or
/// when signalling fails.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        match send_sigterm(pid) {
            Ok(()) => return,
            Err(e) => tracing::warn!(pid, error = %e, "Failed to send SIGTERM, killing instead"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to kill ComfyUI");
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // Safety: kill(2) only reads its arguments; pid is a positive child pid.
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Log each line of a child stream. Lines on stderr mentioning an error are
/// promoted to `error`; the rest of stderr is `debug`.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if !is_stderr {
                    tracing::info!(target: "comfyui_process", "{line}");
                } else if looks_like_error(line) {
                    tracing::error!(target: "comfyui_process", "{line}");
                } else {
                    tracing::debug!(target: "comfyui_process", "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read ComfyUI output");
                break;
            }
        }
    }
}

fn looks_like_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("exception")
}
