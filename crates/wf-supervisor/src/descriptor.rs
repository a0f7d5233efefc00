use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::liveness::{LivenessProbe, SystemProbe};

const DEFAULT_HOST: &str = "localhost";

/// Connection record the daemon writes to `daemon.yaml` once it is serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, port: u16, pid: u32) -> Self {
        Self {
            version: Some(1),
            host: host.into(),
            port,
            pid,
            started_at: Some(Utc::now()),
        }
    }

    pub fn host(&self) -> &str {
        if self.host.trim().is_empty() {
            DEFAULT_HOST
        } else {
            self.host.trim()
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host(), self.port)
    }

    /// A record without a port or pid cannot be connected to or supervised.
    pub fn is_usable(&self) -> bool {
        self.port != 0 && self.pid != 0
    }

    pub fn parse(text: &str) -> Option<Self> {
        match serde_yaml::from_str::<ConnectionDescriptor>(text) {
            Ok(descriptor) if descriptor.is_usable() => Some(descriptor),
            Ok(_) => {
                debug!("daemon descriptor has no port or pid");
                None
            }
            Err(err) => {
                debug!("daemon descriptor is malformed: {err}");
                None
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (pid {})", self.host(), self.port, self.pid)
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }))
}

/// Read access to the daemon's connection record.
pub trait DescriptorSource: Send + Sync {
    /// The record, only if its pid is currently alive.
    fn read(&self) -> Option<ConnectionDescriptor>;
    /// The record as persisted, without checking the pid.
    fn read_raw(&self) -> Option<ConnectionDescriptor>;
}

#[derive(Clone)]
pub struct DescriptorStore {
    path: PathBuf,
    probe: Arc<dyn LivenessProbe>,
}

impl DescriptorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, Arc::new(SystemProbe))
    }

    pub fn with_probe(path: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            path: path.into(),
            probe,
        }
    }

    /// Store at the per-user default location.
    pub fn default_location() -> Self {
        Self::new(wf_util::daemon_file_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for DescriptorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DescriptorSource for DescriptorStore {
    fn read(&self) -> Option<ConnectionDescriptor> {
        let descriptor = self.read_raw()?;
        if self.probe.is_alive(descriptor.pid) {
            Some(descriptor)
        } else {
            debug!(pid = descriptor.pid, "daemon descriptor is stale");
            None
        }
    }

    fn read_raw(&self) -> Option<ConnectionDescriptor> {
        let text = fs::read_to_string(&self.path).ok()?;
        ConnectionDescriptor::parse(&text)
    }
}
