use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::config::ConfigError;

use super::process::TunnelProcess;

/// identifies a tunnel slot on this machine: at most one tunnel may hold a
/// given `(host, local_port)` pair at any time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TunnelKey {
    pub host: String,
    pub local_port: u16,
}
impl TunnelKey {
    pub fn new(host: impl Into<String>, local_port: u16) -> Self {
        TunnelKey {
            host: host.into(),
            local_port,
        }
    }
}
impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.local_port)
    }
}

/// desired state of a single forward, as declared in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TunnelSpec {
    /// ssh destination, anything `ssh` accepts (alias, user@host, ...)
    pub host: String,
    /// port on the remote side, reached as `localhost:<remote_port>`
    pub remote_port: u16,
    /// port bound on this machine
    pub local_port: u16,
}
impl TunnelSpec {
    pub fn new(host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        TunnelSpec {
            host: host.into(),
            remote_port,
            local_port,
        }
    }
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.host.clone(), self.local_port)
    }
    pub fn is_remapped(&self) -> bool {
        self.remote_port != self.local_port
    }
}
impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_remapped() {
            write!(f, "{} \u{2192} {}", self.remote_port, self.local_port)
        } else {
            write!(f, "{}", self.remote_port)
        }
    }
}

/// a running tunnel; only ever created after a successful launch and owned
/// exclusively by the manager
pub(crate) struct TunnelRecord {
    pub host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub(super) process: Box<dyn TunnelProcess>,
}
impl TunnelRecord {
    pub(super) fn new(spec: &TunnelSpec, process: Box<dyn TunnelProcess>) -> Self {
        TunnelRecord {
            host: spec.host.clone(),
            remote_port: spec.remote_port,
            local_port: spec.local_port,
            process,
        }
    }
    pub fn key(&self) -> TunnelKey {
        TunnelKey::new(self.host.clone(), self.local_port)
    }
    pub fn spec(&self) -> TunnelSpec {
        TunnelSpec::new(self.host.clone(), self.remote_port, self.local_port)
    }
    /// polls the process; an error while polling counts as dead so the next
    /// health check reaps the record
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }
}
impl fmt::Debug for TunnelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelRecord")
            .field("host", &self.host)
            .field("remote_port", &self.remote_port)
            .field("local_port", &self.local_port)
            .field("pid", &self.process.id())
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("port {0} is already in use by another process")]
    PortInUse(u16),
    #[error("ssh command not found at {0:?}, is OpenSSH installed?")]
    SshNotFound(PathBuf),
    #[error("failed to start ssh: {1}")]
    Spawn(std::io::Error, String),
    #[error("io error: {1}")]
    Io(std::io::Error, String),
    #[error("configuration error: {0}")]
    Config(String),
}
impl TunnelError {
    pub(crate) fn spawn(err: std::io::Error) -> Self {
        let str = err.to_string();
        Self::Spawn(err, str)
    }
}
impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}
impl From<ConfigError> for TunnelError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
