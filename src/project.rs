//! The project state file, `yeet.toml`: a durable record of what was last
//! deployed where. Found by walking from the working directory toward the
//! filesystem root, written atomically, and mutated only after the
//! corresponding remote call succeeded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::Error;

pub const PROJECT_FILE: &str = "yeet.toml";

/// How a service runs on its host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "run")]
    Run,
    #[serde(rename = "cron")]
    Cron,
    #[default]
    #[serde(rename = "")]
    Empty,
}

/// One deployed service on one host. `(name, host)` is the primary key.
/// Paths are stored relative to the project file's directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceEntry {
    pub name: String,
    pub host: String,
    #[serde(rename = "type", default)]
    pub kind: ServiceKind,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, rename = "services", skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<ServiceEntry>,
}

fn default_schema_version() -> u32 {
    1
}

/// Handle on a loaded (or to-be-created) project file.
pub struct ProjectStore {
    path: PathBuf,
    pub config: ProjectConfig,
}

impl ProjectStore {
    /// An empty store that would save to `path`. Used when callers build
    /// state programmatically before the file exists.
    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            config: ProjectConfig::default(),
        }
    }

    /// Walk from `start` toward the filesystem root looking for the
    /// project file. Stops on first match; a miss lands in `start` itself
    /// so the first save creates the file there.
    pub fn discover(start: &Path) -> Result<Self, Error> {
        for dir in start.ancestors() {
            let candidate = dir.join(PROJECT_FILE);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "project file found");
                return Self::open(&candidate);
            }
        }
        Ok(Self {
            path: start.join(PROJECT_FILE),
            config: ProjectConfig::default(),
        })
    }

    /// Discover from the current working directory.
    pub fn discover_cwd() -> Result<Self, Error> {
        let cwd = std::env::current_dir().map_err(|e| Error::ConfigRead {
            path: PROJECT_FILE.to_string(),
            source: e.into(),
        })?;
        Self::discover(&cwd)
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        let read_err = |source: anyhow::Error| Error::ConfigRead {
            path: path.display().to_string(),
            source,
        };
        let contents = fs::read_to_string(path).map_err(|e| read_err(e.into()))?;
        let config: ProjectConfig = toml::from_str(&contents).map_err(|e| read_err(e.into()))?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// Directory the project file lives in; all stored paths are relative
    /// to this.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the file atomically: serialize to a temp file in the project
    /// directory, then rename over the target.
    pub fn save(&mut self) -> Result<(), Error> {
        self.normalize();
        let write_err = |source: anyhow::Error| Error::ConfigWrite {
            path: self.path.display().to_string(),
            source,
        };

        let body = toml::to_string_pretty(&self.config).map_err(|e| write_err(e.into()))?;
        let dir = self.dir().to_path_buf();
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| write_err(e.into()))?;
        tmp.write_all(body.as_bytes()).map_err(|e| write_err(e.into()))?;
        tmp.persist(&self.path)
            .map_err(|e| write_err(e.error.into()))?;
        debug!(path = %self.path.display(), "project file saved");
        Ok(())
    }

    /// Entries sorted by (name, host); hosts = explicit list ∪ entry
    /// hosts, deduplicated and sorted.
    fn normalize(&mut self) {
        self.config.schema_version = default_schema_version();
        self.config
            .entries
            .sort_by(|a, b| (&a.name, &a.host).cmp(&(&b.name, &b.host)));

        let mut hosts = self.config.hosts.clone();
        hosts.extend(self.config.entries.iter().map(|e| e.host.clone()));
        hosts.sort();
        hosts.dedup();
        self.config.hosts = hosts;
    }

    pub fn get(&self, name: &str, host: &str) -> Option<&ServiceEntry> {
        self.config
            .entries
            .iter()
            .find(|e| e.name == name && e.host == host)
    }

    /// Hosts that have an entry for `name`.
    pub fn hosts_for(&self, name: &str) -> Vec<String> {
        self.config
            .entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.host.clone())
            .collect()
    }

    /// Insert or update by (name, host). Updates replace kind, payload,
    /// schedule, and args; the env file is replaced only when the new
    /// value is non-empty so a plain redeploy doesn't forget it.
    pub fn set_entry(&mut self, entry: ServiceEntry) {
        match self
            .config
            .entries
            .iter_mut()
            .find(|e| e.name == entry.name && e.host == entry.host)
        {
            Some(existing) => {
                existing.kind = entry.kind;
                existing.payload = entry.payload;
                existing.schedule = entry.schedule;
                existing.args = entry.args;
                if let Some(env_file) = entry.env_file.filter(|s| !s.is_empty()) {
                    existing.env_file = Some(env_file);
                }
            }
            None => self.config.entries.push(entry),
        }
    }

    /// Delete by (name, host). Removing a missing entry is a no-op.
    pub fn remove_entry(&mut self, name: &str, host: &str) {
        self.config
            .entries
            .retain(|e| !(e.name == name && e.host == host));
    }

    /// Convert an absolute path to one relative to the project directory.
    /// Anything that cannot be relativized comes back unchanged.
    pub fn relativize(&self, path: &Path) -> String {
        if path.is_relative() {
            return clean_relative(path);
        }
        match pathdiff::diff_paths(path, self.dir()) {
            Some(rel) => clean_relative(&rel),
            None => path.display().to_string(),
        }
    }
}

/// Strip a leading `./` so stored paths read naturally.
fn clean_relative(path: &Path) -> String {
    let s = path.display().to_string();
    s.strip_prefix("./").map(str::to_string).unwrap_or(s)
}
