use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;
use wf_supervisor::{RestartPolicy, StartPolicy, WatchPolicy};

const SHELL_CONFIG_FILE: &str = "shell-config.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ShellConfig {
    /// Empty means `<watchfire dir>/daemon.yaml`.
    pub(crate) descriptor_path: String,
    /// Explicit daemon executable, tried before the usual locations.
    pub(crate) daemon_binary: String,
    pub(crate) start_poll_interval_ms: u64,
    pub(crate) start_poll_attempts: u32,
    pub(crate) watch_interval_ms: u64,
    pub(crate) reconnect_interval_ms: u64,
    pub(crate) restart_cooldown_ms: u64,
    pub(crate) restart_cooldown_max_ms: u64,
    pub(crate) rpc_timeout_ms: u64,
    pub(crate) connect_timeout_ms: u64,
    pub(crate) shutdown_exit_delay_ms: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            descriptor_path: String::new(),
            daemon_binary: String::new(),
            start_poll_interval_ms: 100,
            start_poll_attempts: 50,
            watch_interval_ms: 2_000,
            reconnect_interval_ms: 3_000,
            restart_cooldown_ms: 5_000,
            restart_cooldown_max_ms: 60_000,
            rpc_timeout_ms: 10_000,
            connect_timeout_ms: 2_000,
            shutdown_exit_delay_ms: 3_000,
        }
    }
}

impl ShellConfig {
    pub(crate) fn load() -> Self {
        let mut cfg = Self::load_from(&shell_config_path());
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg
    }

    /// Reads the file layer only. Missing or unreadable files yield
    /// defaults.
    pub(crate) fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<ShellConfig>(&data) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("failed to parse {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", path.display());
                }
                Self::default()
            }
        }
    }

    /// Environment values win over the file; unparsable values are ignored.
    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn num<T: std::str::FromStr>(value: Option<String>, slot: &mut T) {
            if let Some(parsed) = value.and_then(|v| v.trim().parse::<T>().ok()) {
                *slot = parsed;
            }
        }

        if let Some(path) = lookup("WATCHFIRE_DESCRIPTOR_PATH") {
            self.descriptor_path = path;
        }
        if let Some(path) = lookup("WATCHFIRE_DAEMON_BINARY") {
            self.daemon_binary = path;
        }
        num(lookup("WATCHFIRE_START_POLL_INTERVAL_MS"), &mut self.start_poll_interval_ms);
        num(lookup("WATCHFIRE_START_POLL_ATTEMPTS"), &mut self.start_poll_attempts);
        num(lookup("WATCHFIRE_WATCH_INTERVAL_MS"), &mut self.watch_interval_ms);
        num(lookup("WATCHFIRE_RECONNECT_INTERVAL_MS"), &mut self.reconnect_interval_ms);
        num(lookup("WATCHFIRE_RESTART_COOLDOWN_MS"), &mut self.restart_cooldown_ms);
        num(lookup("WATCHFIRE_RESTART_COOLDOWN_MAX_MS"), &mut self.restart_cooldown_max_ms);
        num(lookup("WATCHFIRE_RPC_TIMEOUT_MS"), &mut self.rpc_timeout_ms);
        num(lookup("WATCHFIRE_CONNECT_TIMEOUT_MS"), &mut self.connect_timeout_ms);
        num(lookup("WATCHFIRE_SHUTDOWN_EXIT_DELAY_MS"), &mut self.shutdown_exit_delay_ms);
    }

    pub(crate) fn save(&self) -> io::Result<()> {
        wf_util::write_json_atomic(&shell_config_path(), self)
    }

    pub(crate) fn descriptor_path(&self) -> PathBuf {
        if self.descriptor_path.trim().is_empty() {
            wf_util::daemon_file_path()
        } else {
            wf_util::expand_user(self.descriptor_path.trim())
        }
    }

    pub(crate) fn daemon_binary(&self) -> Option<PathBuf> {
        let trimmed = self.daemon_binary.trim();
        (!trimmed.is_empty()).then(|| wf_util::expand_user(trimmed))
    }

    pub(crate) fn start_policy(&self) -> StartPolicy {
        StartPolicy {
            poll_interval: ms(self.start_poll_interval_ms),
            max_attempts: self.start_poll_attempts.max(1),
        }
    }

    pub(crate) fn watch_policy(&self) -> WatchPolicy {
        WatchPolicy {
            interval: ms(self.watch_interval_ms),
        }
    }

    pub(crate) fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            cooldown: ms(self.restart_cooldown_ms),
            max_cooldown: ms(self.restart_cooldown_max_ms.max(self.restart_cooldown_ms)),
            max_attempts: None,
        }
    }

    pub(crate) fn reconnect_interval(&self) -> Duration {
        ms(self.reconnect_interval_ms)
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        ms(self.rpc_timeout_ms)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        ms(self.connect_timeout_ms)
    }

    pub(crate) fn shutdown_exit_delay(&self) -> Duration {
        ms(self.shutdown_exit_delay_ms)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub(crate) fn shell_config_path() -> PathBuf {
    wf_util::state_file_path(SHELL_CONFIG_FILE)
}
