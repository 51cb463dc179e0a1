//! Per-user preferences and the process-wide settings record.
//!
//! Preferences live in `~/.yeet/prefs.json`. Environment variables
//! (`CATCH_HOST`, `CATCH_RPC_PORT`) override the on-disk values at
//! startup; `--host`/`--service`/`--rpc-port` flags override both. The
//! merged result is frozen into a process-wide record during flag
//! parsing and read-only afterwards.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::progress::ProgressMode;

pub const DEFAULT_HOST: &str = "catch";
pub const DEFAULT_RPC_PORT: u16 = 41548;

pub const ENV_HOST: &str = "CATCH_HOST";
pub const ENV_RPC_PORT: &str = "CATCH_RPC_PORT";

/// On-disk preferences document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_port: Option<u16>,
}

impl Preferences {
    pub fn path() -> Result<PathBuf, Error> {
        let home = home::home_dir().ok_or_else(|| Error::ConfigRead {
            path: "~/.yeet/prefs.json".to_string(),
            source: anyhow::anyhow!("cannot determine home directory"),
        })?;
        Ok(home.join(".yeet").join("prefs.json"))
    }

    /// Load the preferences file; a missing file is an empty record.
    pub fn load() -> Result<Self, Error> {
        let path = Self::path()?;
        if !path.is_file() {
            return Ok(Self::default());
        }
        let read_err = |source: anyhow::Error| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        };
        let contents = fs::read_to_string(&path).map_err(|e| read_err(e.into()))?;
        serde_json::from_str(&contents).map_err(|e| read_err(e.into()))
    }

    /// Persist to disk. Only `prefs --save` calls this.
    pub fn save(&self) -> Result<(), Error> {
        let path = Self::path()?;
        let write_err = |source: anyhow::Error| Error::ConfigWrite {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.into()))?;
        }
        let body = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        fs::write(&path, body).map_err(|e| write_err(e.into()))?;
        debug!(path = %path.display(), "preferences saved");
        Ok(())
    }
}

/// The merged, process-wide settings record. Built once in `cli::run`
/// after flag parsing; read-only for the rest of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default host after env/prefs merge (not the `--host` pin).
    pub default_host: String,
    /// Host pinned with `--host` for this invocation, if any.
    pub host_override: Option<String>,
    /// Service pinned with `--service`, if any.
    pub service_override: Option<String>,
    pub rpc_port: u16,
    pub progress: ProgressMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_host: DEFAULT_HOST.to_string(),
            host_override: None,
            service_override: None,
            rpc_port: DEFAULT_RPC_PORT,
            progress: ProgressMode::Auto,
        }
    }
}

/// Merge precedence for the default host: env var, then prefs file, then
/// the hard-coded default. Ports follow the same chain.
pub fn merge(
    prefs: &Preferences,
    env_host: Option<String>,
    env_port: Option<String>,
    host_flag: Option<String>,
    service_flag: Option<String>,
    port_flag: Option<u16>,
    progress: ProgressMode,
) -> Settings {
    let default_host = env_host
        .filter(|h| !h.is_empty())
        .or_else(|| prefs.default_host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let rpc_port = port_flag
        .or_else(|| env_port.and_then(|p| p.parse().ok()))
        .or(prefs.rpc_port)
        .unwrap_or(DEFAULT_RPC_PORT);

    Settings {
        default_host,
        host_override: host_flag.filter(|h| !h.is_empty()),
        service_override: service_flag.filter(|s| !s.is_empty()),
        rpc_port,
        progress,
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Freeze the merged settings. Called exactly once from `cli::run`.
pub fn init(settings: Settings) {
    let _ = SETTINGS.set(settings);
}

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

/// Build settings from flags plus the ambient environment and prefs file.
pub fn startup(
    host_flag: Option<String>,
    service_flag: Option<String>,
    port_flag: Option<u16>,
    progress: ProgressMode,
) -> anyhow::Result<Settings> {
    let prefs = Preferences::load().context("loading preferences")?;
    Ok(merge(
        &prefs,
        std::env::var(ENV_HOST).ok(),
        std::env::var(ENV_RPC_PORT).ok(),
        host_flag,
        service_flag,
        port_flag,
        progress,
    ))
}
