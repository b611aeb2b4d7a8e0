use std::{collections::HashMap, time::Duration};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::{
    ports::PortProbe,
    process::{ProcessLauncher, TunnelProcess},
    tunnel::{TunnelError, TunnelKey, TunnelRecord, TunnelSpec},
};

/// bounds for the two termination stages of `kill`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KillTimeouts {
    /// how long to wait after SIGTERM
    pub graceful: Duration,
    /// how long to wait after SIGKILL
    pub forced: Duration,
}
impl Default for KillTimeouts {
    fn default() -> Self {
        KillTimeouts {
            graceful: Duration::from_secs(3),
            forced: Duration::from_secs(2),
        }
    }
}

/// result of `TunnelManager::spawn`. A displacement happens before the launch
/// and is reported even when the launch fails afterwards.
#[derive(Debug)]
pub(crate) struct SpawnOutcome {
    pub result: Result<(), TunnelError>,
    /// tunnel that was killed to free the local port
    pub displaced: Option<TunnelKey>,
}
impl SpawnOutcome {
    fn ok(displaced: Option<TunnelKey>) -> Self {
        SpawnOutcome {
            result: Ok(()),
            displaced,
        }
    }
    fn failed(err: TunnelError, displaced: Option<TunnelKey>) -> Self {
        SpawnOutcome {
            result: Err(err),
            displaced,
        }
    }
}

/// Owns every tunnel process started by this program.
///
/// Not meant to be shared between threads: all calls come from the single
/// supervising loop. Queries take `&mut self` because liveness is polled from
/// the OS process on demand.
pub(crate) struct TunnelManager {
    tunnels: HashMap<TunnelKey, TunnelRecord>,
    launcher: Box<dyn ProcessLauncher>,
    probe: Box<dyn PortProbe>,
    timeouts: KillTimeouts,
}
impl TunnelManager {
    pub fn new(launcher: Box<dyn ProcessLauncher>, probe: Box<dyn PortProbe>) -> Self {
        TunnelManager {
            tunnels: HashMap::new(),
            launcher,
            probe,
            timeouts: KillTimeouts::default(),
        }
    }
    #[cfg(test)]
    pub fn with_timeouts(mut self, timeouts: KillTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn is_active(&mut self, key: &TunnelKey) -> bool {
        self.tunnels
            .get_mut(key)
            .is_some_and(|record| record.is_alive())
    }

    pub fn has_active(&mut self) -> bool {
        self.tunnels.values_mut().any(|record| record.is_alive())
    }

    /// Key of a live tunnel bound to `local_port`, if any.
    ///
    /// Linear in the number of tracked tunnels, which stays in the tens.
    pub fn find_by_local_port(&mut self, local_port: u16) -> Option<TunnelKey> {
        self.tunnels
            .values_mut()
            .find_map(|record| {
                (record.local_port == local_port && record.is_alive()).then(|| record.key())
            })
    }

    /// spec the tracked tunnel was started with
    pub fn tracked_spec(&self, key: &TunnelKey) -> Option<TunnelSpec> {
        self.tunnels.get(key).map(TunnelRecord::spec)
    }

    pub fn active_keys(&mut self) -> Vec<TunnelKey> {
        let mut keys: Vec<TunnelKey> = self
            .tunnels
            .values_mut()
            .filter_map(|record| record.is_alive().then(|| record.key()))
            .collect();
        keys.sort();
        keys
    }

    /// Starts the tunnel described by `spec`.
    ///
    /// A no-op when the same tunnel already runs. Another of our tunnels on
    /// the same local port is killed first and returned as displaced; a port
    /// held by a foreign process fails with `PortInUse` without touching any
    /// state.
    pub async fn spawn(&mut self, spec: &TunnelSpec) -> SpawnOutcome {
        let key = spec.key();
        if self.is_active(&key) {
            debug!(%key, "tunnel already running");
            return SpawnOutcome::ok(None);
        }

        let mut displaced = None;
        if let Some(existing) = self.find_by_local_port(spec.local_port) {
            info!(%existing, %key, "local port taken by another tunnel, displacing it");
            self.kill(&existing).await;
            displaced = Some(existing);
        } else if self.probe.is_port_in_use(spec.local_port).await {
            return SpawnOutcome::failed(TunnelError::PortInUse(spec.local_port), None);
        }

        match self.launcher.launch(spec) {
            Ok(process) => {
                // a dead record may still sit under this key until the next
                // health check, its exit is reported here instead
                let record = TunnelRecord::new(spec, process);
                if let Some(mut replaced) = self.tunnels.insert(key.clone(), record) {
                    match replaced.process.try_wait() {
                        Ok(Some(status)) => warn!(%key, "tunnel exited with {}", status),
                        _ => warn!(%key, "replacing a dead tunnel"),
                    }
                    log_stderr(&key, replaced.process.as_mut()).await;
                }
                SpawnOutcome::ok(displaced)
            }
            Err(e) => {
                error!(%key, "could not start tunnel: {}", e);
                SpawnOutcome::failed(e, displaced)
            }
        }
    }

    /// Stops a tunnel, SIGTERM first and SIGKILL when it does not comply.
    /// Unknown keys are ignored.
    pub async fn kill(&mut self, key: &TunnelKey) {
        if let Some(record) = self.tunnels.remove(key) {
            info!(%key, "killing tunnel");
            terminate(record.process, self.timeouts, key).await;
        }
    }

    pub async fn kill_all(&mut self) {
        let records: Vec<TunnelRecord> = self.tunnels.drain().map(|(_, record)| record).collect();
        Self::terminate_records(records, self.timeouts).await;
    }

    /// kills exactly `keys`, everything else keeps running
    pub async fn kill_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a TunnelKey>) {
        let records: Vec<TunnelRecord> = keys
            .into_iter()
            .filter_map(|key| self.tunnels.remove(key))
            .collect();
        Self::terminate_records(records, self.timeouts).await;
    }

    async fn terminate_records(records: Vec<TunnelRecord>, timeouts: KillTimeouts) {
        join_all(records.into_iter().map(|record| async move {
            let key = record.key();
            info!(%key, "killing tunnel");
            terminate(record.process, timeouts, &key).await;
        }))
        .await;
    }

    /// Drops every tunnel whose process exited since the last call and
    /// returns their keys.
    pub async fn health_check(&mut self) -> Vec<TunnelKey> {
        let mut dead = Vec::new();
        for (key, record) in self.tunnels.iter_mut() {
            match record.process.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    warn!(%key, "tunnel exited with {}", status);
                    dead.push(key.clone());
                }
                Err(e) => {
                    warn!(%key, "could not poll tunnel process: {}", e);
                    dead.push(key.clone());
                }
            }
        }
        for key in &dead {
            if let Some(mut record) = self.tunnels.remove(key) {
                log_stderr(key, record.process.as_mut()).await;
            }
        }
        dead.sort();
        dead
    }
}

/// logs what an exited tunnel left on stderr
async fn log_stderr(key: &TunnelKey, process: &mut dyn TunnelProcess) {
    if let Some(stderr) = process.stderr_tail().await {
        warn!(%key, "ssh said: {}", stderr);
    }
}

/// Two-stage stop. The SIGKILL stage runs whenever the SIGTERM stage did not
/// confirm an exit, including when waiting itself failed. Never blocks longer
/// than both timeouts combined.
async fn terminate(mut process: Box<dyn TunnelProcess>, timeouts: KillTimeouts, key: &TunnelKey) {
    if let Err(e) = process.terminate() {
        debug!(%key, "SIGTERM failed: {}", e);
    }
    match process.wait_timeout(timeouts.graceful).await {
        Ok(Some(status)) => {
            debug!(%key, "tunnel stopped with {}", status);
            return;
        }
        Ok(None) => warn!(%key, "tunnel ignored SIGTERM, killing it"),
        Err(e) => warn!(%key, "waiting for tunnel failed: {}, killing it", e),
    }

    if let Err(e) = process.force_kill() {
        debug!(%key, "SIGKILL failed: {}", e);
    }
    match process.wait_timeout(timeouts.forced).await {
        Ok(Some(_)) => {}
        Ok(None) => error!(%key, "tunnel still running after SIGKILL, dropping it anyway"),
        Err(e) => error!(%key, "could not confirm tunnel exit: {}", e),
    }
}
