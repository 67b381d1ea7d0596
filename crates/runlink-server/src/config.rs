use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use librunlink::{IdAllocator, RunSettings};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8028;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_processes: u32,
    /// Scratch directory for entrypoints written from submitted code.
    pub work_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub run_as_user: Option<String>,
    pub debug: bool,
    pub stop_grace_ms: u64,
    pub watchdog_secs: u64,
}

impl ServerConfig {
    /// Read `path` (or the default config file when it exists), then apply
    /// `RUNLINK_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(port) = var("RUNLINK_PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid RUNLINK_PORT value: {port}"))?;
            self.listen.set_port(port);
        }
        if let Some(max) = var("RUNLINK_MAX_PROCESSES") {
            self.max_processes = max
                .parse()
                .with_context(|| format!("invalid RUNLINK_MAX_PROCESSES value: {max}"))?;
        }
        if let Some(dir) = var("RUNLINK_WORK_DIR").filter(|dir| !dir.is_empty()) {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var(runlink_protocol::paths::IPC_DIR_ENV).filter(|dir| !dir.is_empty()) {
            self.ipc_dir = PathBuf::from(dir);
        }
        if let Some(user) = var("RUNLINK_RUN_AS_USER") {
            self.run_as_user = Some(user).filter(|user| !user.is_empty());
        }
        if let Some(debug) = var("RUNLINK_DEBUG") {
            self.debug = is_truthy(&debug);
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_dir).join("runlink").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("runlink")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/runlink/config.toml")
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        let mut settings = RunSettings::new(
            Arc::new(IdAllocator::new(self.max_processes)),
            self.ipc_dir.clone(),
            self.work_dir.clone(),
        );
        settings.run_as_user = self.run_as_user.clone();
        settings.stop_grace = Duration::from_millis(self.stop_grace_ms);
        settings.watchdog_timeout = Duration::from_secs(self.watchdog_secs);
        settings
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_processes: 100,
            work_dir: std::env::temp_dir().join("runlink"),
            ipc_dir: std::env::temp_dir(),
            run_as_user: None,
            debug: false,
            stop_grace_ms: 1000,
            watchdog_secs: 30,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_fill_in_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9000"
            run_as_user = "pi"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.run_as_user.as_deref(), Some("pi"));
        assert_eq!(config.max_processes, 100);
        assert_eq!(config.stop_grace_ms, 1000);
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = ServerConfig::default();
        config
            .apply_env(env(&[
                ("RUNLINK_PORT", "9100"),
                ("RUNLINK_MAX_PROCESSES", "5"),
                ("RUNLINK_WORK_DIR", "/srv/runlink"),
                ("RUNLINK_IPC_DIR", "/run/runlink"),
                ("RUNLINK_RUN_AS_USER", "pi"),
                ("RUNLINK_DEBUG", "True"),
            ]))
            .unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.max_processes, 5);
        assert_eq!(config.work_dir, PathBuf::from("/srv/runlink"));
        assert_eq!(config.ipc_dir, PathBuf::from("/run/runlink"));
        assert_eq!(config.run_as_user.as_deref(), Some("pi"));
        assert!(config.debug);
    }

    #[test]
    fn empty_user_clears_run_as_user() {
        let mut config = ServerConfig {
            run_as_user: Some("pi".to_string()),
            ..ServerConfig::default()
        };
        config.apply_env(env(&[("RUNLINK_RUN_AS_USER", "")])).unwrap();
        assert_eq!(config.run_as_user, None);
    }

    #[test]
    fn bad_port_is_an_error() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env(&[("RUNLINK_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("RUNLINK_PORT"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
