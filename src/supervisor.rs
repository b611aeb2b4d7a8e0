use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ConfigError, ServerEntry, TunnelbarConfig, load_config},
    diff::{ConfigDiff, diff_configs},
    tunneling::{
        manager::TunnelManager,
        tunnel::{TunnelError, TunnelKey, TunnelSpec},
    },
};

/// servers whose tunnels the supervisor brings up
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Selection {
    All,
    Servers(Vec<String>),
}
impl Selection {
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            Selection::All
        } else {
            Selection::Servers(names)
        }
    }
    pub fn includes(&self, server: &ServerEntry) -> bool {
        match self {
            Selection::All => true,
            Selection::Servers(names) => names.iter().any(|name| *name == server.name),
        }
    }
    pub fn specs(&self, config: &TunnelbarConfig) -> Vec<TunnelSpec> {
        config
            .servers
            .iter()
            .filter(|server| self.includes(server))
            .flat_map(ServerEntry::tunnel_specs)
            .collect()
    }
    /// selected names that no server in `config` carries
    pub fn unknown<'a>(&'a self, config: &TunnelbarConfig) -> Vec<&'a str> {
        match self {
            Selection::All => Vec::new(),
            Selection::Servers(names) => names
                .iter()
                .filter(|name| config.server(name).is_none())
                .map(String::as_str)
                .collect(),
        }
    }
}

/// Drives the manager: starts the selected tunnels, polls their health,
/// follows config reloads and tears everything down on exit.
pub(crate) struct Supervisor {
    config_path: PathBuf,
    config: TunnelbarConfig,
    manager: TunnelManager,
    selection: Selection,
    /// mtime of the config when it was last loaded
    modified: Option<SystemTime>,
    /// whether any tunnel was up after the last round
    any_active: bool,
}
impl Supervisor {
    pub fn new(
        config_path: PathBuf,
        config: TunnelbarConfig,
        manager: TunnelManager,
        selection: Selection,
    ) -> Self {
        let modified = modified_time(&config_path);
        Supervisor {
            config_path,
            config,
            manager,
            selection,
            modified,
            any_active: false,
        }
    }

    #[cfg(test)]
    pub fn config(&self) -> &TunnelbarConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn manager(&mut self) -> &mut TunnelManager {
        &mut self.manager
    }

    /// returns how many tunnels are up afterwards
    pub async fn start_selected(&mut self) -> usize {
        let mut started = 0;
        for spec in self.selection.specs(&self.config) {
            if self.start(&spec).await {
                started += 1;
            }
        }
        self.report_activity();
        started
    }

    async fn start(&mut self, spec: &TunnelSpec) -> bool {
        let key = spec.key();
        let outcome = self.manager.spawn(spec).await;
        if let Some(displaced) = outcome.displaced {
            warn!(%displaced, %key, "tunnel displaced to free local port {}", key.local_port);
        }
        match outcome.result {
            Ok(()) => {
                info!(%key, forward = %spec, "tunnel up");
                true
            }
            Err(e) => {
                error!(%key, "tunnel error: {}", e);
                false
            }
        }
    }

    /// One health check round. Dropped tunnels are reported and returned;
    /// with `watch` on, a modified config file is reloaded afterwards.
    pub async fn tick(&mut self) -> Vec<TunnelKey> {
        let dropped = self.manager.health_check().await;
        for key in &dropped {
            warn!(host = %key.host, port = key.local_port, "tunnel dropped: port {} disconnected", key.local_port);
        }
        if self.config.settings.watch && self.config_changed() {
            info!("config file changed on disk");
            // errors are reported by reload, the running tunnels stay
            let _ = self.reload().await;
        }
        self.report_activity();
        dropped
    }

    fn report_activity(&mut self) {
        let any_active = self.manager.has_active();
        if any_active != self.any_active {
            if any_active {
                info!("tunnels active");
            } else {
                info!("no tunnel running");
            }
            self.any_active = any_active;
        }
    }

    fn config_changed(&self) -> bool {
        let current = modified_time(&self.config_path);
        current.is_some() && current != self.modified
    }

    /// Loads the config again and applies it: removed tunnels are killed,
    /// added ones in the selection started, tunnels whose remote port changed
    /// restarted. Everything else keeps running untouched.
    ///
    /// A config that fails to load leaves all tunnels and the current config
    /// as they are.
    pub async fn reload(&mut self) -> Result<ConfigDiff, ConfigError> {
        // remember the attempt so a broken file is not retried on every tick
        self.modified = modified_time(&self.config_path);
        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("config error, keeping current tunnels: {}", e);
                return Err(e);
            }
        };

        for setting in self.config.settings.restart_required(&new_config.settings) {
            warn!("settings.{} changed, restart tunnelbar to apply it", setting);
        }
        let diff = diff_configs(&self.config, &new_config);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "reloading config"
        );
        if diff.is_empty() {
            debug!("no tunnel added or removed");
        }
        self.manager.kill_keys(&diff.removed).await;

        for spec in self.selection.specs(&new_config) {
            let key = spec.key();
            if diff.added.contains(&key) {
                self.start(&spec).await;
            } else if let Some(running) = self.manager.tracked_spec(&key) {
                if running.remote_port != spec.remote_port {
                    info!(%key, from = running.remote_port, to = spec.remote_port, "remote port changed, restarting tunnel");
                    self.manager.kill(&key).await;
                    self.start(&spec).await;
                }
            }
        }

        self.config = new_config;
        self.report_activity();
        Ok(diff)
    }

    /// Supervises until SIGTERM or Ctrl-C, then kills every tunnel. SIGHUP
    /// reloads the config.
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let mut reload_signal = ReloadSignal::new()?;
        let mut shutdown_signal = ShutdownSignal::new()?;

        let mut period = self.config.settings.health_check_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?period, "supervising tunnels");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = reload_signal.recv() => {
                    info!("SIGHUP received, reloading config");
                    let _ = self.reload().await;
                }
                _ = shutdown_signal.recv() => {
                    break;
                }
            }

            let wanted = self.config.settings.health_check_interval();
            if wanted != period {
                period = wanted;
                ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(interval = ?period, "health check interval changed");
            }
        }

        let running = self.manager.active_keys();
        info!(tunnels = running.len(), "stopping tunnels");
        self.manager.kill_all().await;
        Ok(())
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

struct ReloadSignal {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}
impl ReloadSignal {
    fn new() -> io::Result<Self> {
        Ok(ReloadSignal {
            #[cfg(unix)]
            hangup: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?,
        })
    }
    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            self.hangup.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    }
}

struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}
impl ShutdownSignal {
    fn new() -> io::Result<Self> {
        Ok(ShutdownSignal {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }
    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.terminate.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
