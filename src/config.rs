use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{
    Deserialize,
    de::{self, Visitor},
};
use thiserror::Error;

use crate::tunneling::tunnel::{TunnelKey, TunnelSpec};

pub const CONFIG_DIR: &str = "tunnelbar";
pub const CONFIG_FILE: &str = "config.toml";
/// written on first run
pub const EXAMPLE_CONFIG: &str = include_str!("../config.example.toml");
/// one day; larger values cannot be scheduled reliably
pub const MAX_HEALTH_CHECK_INTERVAL: u64 = 86_400;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// the file is not valid TOML
    #[error("{path:?} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// valid TOML that does not describe a tunnelbar config
    #[error("invalid config {path:?}: {message}")]
    Schema { path: PathBuf, message: String },
    #[error("could not determine the user config directory")]
    NoConfigDir,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct TunnelbarConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct Settings {
    /// seconds between two health checks
    pub health_check_interval: u64,
    /// ssh binary, looked up on PATH when unset
    pub ssh_path: Option<PathBuf>,
    /// reload the file when it changes on disk
    pub watch: bool,
}
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerEntry {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<PortEntry>,
}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortEntry {
    pub remote_port: u16,
    /// equals `remote_port` unless remapped
    pub local_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            health_check_interval: 10,
            ssh_path: None,
            watch: true,
        }
    }
}
impl Settings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
    /// settings that differ from `newer` but only apply after a restart
    pub fn restart_required(&self, newer: &Settings) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.ssh_path != newer.ssh_path {
            changed.push("ssh_path");
        }
        changed
    }
}

impl ServerEntry {
    pub fn tunnel_specs(&self) -> impl Iterator<Item = TunnelSpec> + '_ {
        self.ports
            .iter()
            .map(|port| TunnelSpec::new(self.host.clone(), port.remote_port, port.local_port))
    }
}

impl TunnelbarConfig {
    /// every declared tunnel, in file order
    pub fn tunnel_specs(&self) -> impl Iterator<Item = TunnelSpec> + '_ {
        self.servers.iter().flat_map(ServerEntry::tunnel_specs)
    }
    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|server| server.name == name)
    }

    fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_HEALTH_CHECK_INTERVAL).contains(&self.settings.health_check_interval) {
            return Err(format!(
                "settings.health_check_interval must be between 1 and {MAX_HEALTH_CHECK_INTERVAL} seconds"
            ));
        }
        let mut seen: HashSet<TunnelKey> = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err("server name must not be empty".to_string());
            }
            if server.host.trim().is_empty() {
                return Err(format!("server `{}` has an empty host", server.name));
            }
            for spec in server.tunnel_specs() {
                let key = spec.key();
                if !seen.insert(key.clone()) {
                    return Err(format!(
                        "local port {} of {} is declared twice",
                        key.local_port, key.host
                    ));
                }
            }
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for PortEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PortEntryVisitor;
        impl<'de> Visitor<'de> for PortEntryVisitor {
            type Value = PortEntry;
            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a port number or a map with `port` and an optional `local_port`")
            }
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let port = port_number::<E>(v)?;
                Ok(PortEntry {
                    remote_port: port,
                    local_port: port,
                })
            }
            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_i64(i64::try_from(v).unwrap_or(i64::MAX))
            }
            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut port = None;
                let mut local_port = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "port" => port = Some(port_number::<A::Error>(map.next_value()?)?),
                        "local_port" => {
                            local_port = Some(port_number::<A::Error>(map.next_value()?)?)
                        }
                        _ => return Err(de::Error::unknown_field(&key, &["port", "local_port"])),
                    }
                }

                let remote_port = port.ok_or_else(|| de::Error::missing_field("port"))?;
                Ok(PortEntry {
                    remote_port,
                    local_port: local_port.unwrap_or(remote_port), // not remapped
                })
            }
        }
        deserializer.deserialize_any(PortEntryVisitor)
    }
}

fn port_number<E: de::Error>(v: i64) -> Result<u16, E> {
    match u16::try_from(v) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(E::custom(format!("{v} is not a valid port, expected 1-65535"))),
    }
}

/// `<config dir>/tunnelbar/config.toml`
pub fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

/// Creates the config from the bundled example when it is missing.
/// Returns whether the file was already there.
pub fn ensure_config(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(true);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, EXAMPLE_CONFIG).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("created config at {:?}", path);
    Ok(false)
}

pub(crate) fn load_config(path: &Path) -> Result<TunnelbarConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content, path)
}

pub(crate) fn parse_config(content: &str, path: &Path) -> Result<TunnelbarConfig, ConfigError> {
    let table: toml::Table = content.parse().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let schema_error = |message: String| ConfigError::Schema {
        path: path.to_path_buf(),
        message,
    };
    let config: TunnelbarConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| schema_error(e.message().to_string()))?;
    config.validate().map_err(schema_error)?;
    tracing::debug!(servers = config.servers.len(), "loaded config from {:?}", path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<TunnelbarConfig, ConfigError> {
        parse_config(content, Path::new("config.toml"))
    }

    fn schema_message(content: &str) -> String {
        match parse(content) {
            Err(ConfigError::Schema { message, .. }) => message,
            other => panic!("expected a schema error, got {other:?}"),
        }
    }

    #[test]
    fn check_basic_deserialization() {
        let config = parse(
            r#"
            [settings]
            health_check_interval = 5
            ssh_path = "/opt/bin/ssh"
            watch = false
            [[servers]]
            name = "db"
            host = "db.internal"
            ports = [5432, { port = 8080, local_port = 18080 }, { port = 22 }]
            [[servers]]
            name = "web"
            host = "deploy@web.internal"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.settings,
            Settings {
                health_check_interval: 5,
                ssh_path: Some(PathBuf::from("/opt/bin/ssh")),
                watch: false,
            }
        );
        assert_eq!(config.servers.len(), 2);
        assert_eq!(
            config.servers[0],
            ServerEntry {
                name: String::from("db"),
                host: String::from("db.internal"),
                ports: vec![
                    PortEntry {
                        remote_port: 5432,
                        local_port: 5432
                    },
                    PortEntry {
                        remote_port: 8080,
                        local_port: 18080
                    },
                    PortEntry {
                        remote_port: 22,
                        local_port: 22
                    },
                ],
            }
        );
        assert!(config.servers[1].ports.is_empty());
        assert_eq!(config.server("web").unwrap().host, "deploy@web.internal");
        assert_eq!(
            config.tunnel_specs().collect::<Vec<_>>(),
            vec![
                TunnelSpec::new("db.internal", 5432, 5432),
                TunnelSpec::new("db.internal", 8080, 18080),
                TunnelSpec::new("db.internal", 22, 22),
            ]
        );
    }

    #[test]
    fn empty_file_is_an_empty_config() {
        let config = parse("").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.health_check_interval(), Duration::from_secs(10));
    }

    #[test]
    fn bundled_example_is_valid() {
        let config = parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.tunnel_specs().count(), 2);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let result = parse("[[servers]\nname = ");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn schema_violations() {
        let missing_host = schema_message("[[servers]]\nname = \"db\"\nports = [1]");
        assert!(missing_host.contains("host"), "{missing_host}");

        let port_zero = schema_message("[[servers]]\nname = \"a\"\nhost = \"h\"\nports = [0]");
        assert!(port_zero.contains("not a valid port"), "{port_zero}");

        let too_big = schema_message(
            "[[servers]]\nname = \"a\"\nhost = \"h\"\nports = [{ port = 22, local_port = 70000 }]",
        );
        assert!(too_big.contains("70000"), "{too_big}");

        let no_port =
            schema_message("[[servers]]\nname = \"a\"\nhost = \"h\"\nports = [{ local_port = 1 }]");
        assert!(no_port.contains("port"), "{no_port}");

        let unknown = schema_message("[[servers]]\nname = \"a\"\nhost = \"h\"\nuser = \"x\"");
        assert!(unknown.contains("user"), "{unknown}");

        let wrong_type = schema_message("[[servers]]\nname = \"a\"\nhost = \"h\"\nports = [\"22\"]");
        assert!(!wrong_type.is_empty());

        let empty_host = schema_message("[[servers]]\nname = \"a\"\nhost = \" \"");
        assert!(empty_host.contains("empty host"), "{empty_host}");

        let interval = schema_message("[settings]\nhealth_check_interval = 0");
        assert!(interval.contains("health_check_interval"), "{interval}");

        let huge = schema_message("[settings]\nhealth_check_interval = 9223372036854775807");
        assert!(huge.contains("between 1 and 86400"), "{huge}");
        let a_day = parse("[settings]\nhealth_check_interval = 86400").unwrap();
        assert_eq!(a_day.settings.health_check_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn ssh_path_change_needs_restart() {
        let current = Settings::default();
        let moved = Settings {
            ssh_path: Some(PathBuf::from("/opt/bin/ssh")),
            ..Settings::default()
        };
        let slower = Settings {
            health_check_interval: 60,
            watch: false,
            ..Settings::default()
        };
        assert_eq!(current.restart_required(&moved), vec!["ssh_path"]);
        assert!(current.restart_required(&slower).is_empty());
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let message = schema_message(
            r#"
            [[servers]]
            name = "a"
            host = "h"
            ports = [{ port = 22, local_port = 2222 }]
            [[servers]]
            name = "b"
            host = "h"
            ports = [{ port = 2200, local_port = 2222 }]
            "#,
        );
        assert!(message.contains("2222"), "{message}");
    }

    #[test]
    fn same_local_port_on_two_hosts_is_allowed() {
        let config = parse(
            r#"
            [[servers]]
            name = "a"
            host = "a.internal"
            ports = [8080]
            [[servers]]
            name = "b"
            host = "b.internal"
            ports = [8080]
            "#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn ensure_config_writes_example_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        assert!(!ensure_config(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXAMPLE_CONFIG);

        std::fs::write(&path, "servers = []").unwrap();
        assert!(ensure_config(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "servers = []");
        assert!(load_config(&path).unwrap().servers.is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
