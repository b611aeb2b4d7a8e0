use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
};

#[cfg(test)]
use mockall::automock;

use super::tunnel::{TunnelError, TunnelSpec};

const FALLBACK_SSH: &str = "/usr/bin/ssh";
/// upper bound for collecting stderr of an exited tunnel
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(250);
const STDERR_TAIL_BYTES: usize = 512;

/// starts forwarding processes
#[cfg_attr(test, automock)]
pub(crate) trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError>;
}

/// owned handle to a forwarding process
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait TunnelProcess: Send {
    fn id(&self) -> Option<u32>;
    /// non blocking, `Ok(None)` while the process runs
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    /// asks the process to exit (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;
    /// SIGKILL
    fn force_kill(&mut self) -> io::Result<()>;
    /// waits at most `limit`, `Ok(None)` when the process is still running
    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<Option<ExitStatus>>;
    /// whatever the process left on stderr, trimmed to its last bytes
    async fn stderr_tail(&mut self) -> Option<String>;
}

/// launches `ssh -N -L local:localhost:remote host`
pub(crate) struct SshLauncher {
    program: PathBuf,
}
impl SshLauncher {
    pub fn new(program: Option<PathBuf>) -> Self {
        SshLauncher {
            program: program.unwrap_or_else(locate_ssh),
        }
    }
    pub fn program(&self) -> &Path {
        &self.program
    }
}
impl ProcessLauncher for SshLauncher {
    fn launch(&self, spec: &TunnelSpec) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let args = forward_args(spec);
        tracing::info!("spawning tunnel: {} {}", self.program.display(), args.join(" "));
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TunnelError::SshNotFound(self.program.clone()),
                _ => TunnelError::spawn(e),
            })?;
        tracing::debug!(pid = ?child.id(), key = %spec.key(), "tunnel process started");
        Ok(Box::new(SshProcess { child }))
    }
}

/// first `ssh` found on `PATH`
pub(crate) fn locate_ssh() -> PathBuf {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join("ssh"))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(FALLBACK_SSH))
}

/// batch mode so ssh never prompts, and exit on forward failure so a bind
/// error ends the process instead of leaving it hanging
pub(crate) fn forward_args(spec: &TunnelSpec) -> Vec<String> {
    vec![
        "-N".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-L".to_string(),
        format!("{}:localhost:{}", spec.local_port, spec.remote_port),
        spec.host.clone(),
    ]
}

pub(crate) struct SshProcess {
    child: Child,
}
#[async_trait]
impl TunnelProcess for SshProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // no pid means the child was already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }
    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
    fn force_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
    async fn wait_timeout(&mut self, limit: Duration) -> io::Result<Option<ExitStatus>> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }
    async fn stderr_tail(&mut self) -> Option<String> {
        let mut stderr = self.child.stderr.take()?;
        let mut buf = Vec::new();
        // a grandchild may still hold the pipe open, so never wait for EOF
        let _ = tokio::time::timeout(STDERR_READ_TIMEOUT, stderr.read_to_end(&mut buf)).await;
        tail(&buf)
    }
}

fn tail(buf: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|i| text.len() - i <= STDERR_TAIL_BYTES)
        .unwrap_or(text.len());
    Some(text[start..].to_string())
}
