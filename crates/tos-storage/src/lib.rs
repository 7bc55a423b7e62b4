use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tos_core::{ExtensionManifest, RemoteLayout, Roster, Taskspace, TaskspaceId, TaskspaceState};
use tracing::warn;

const ROSTER_FILE: &str = "taskspaces.json";
const SETTINGS_FILE: &str = "settings.json";
const APP_DIR: &str = "theoldswitcheroo";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted image of the roster. Field names are the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterSnapshot {
    pub hostname: String,
    #[serde(
        rename = "activeTaskSpaceUuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub active_task_space_uuid: Option<TaskspaceId>,
    #[serde(default)]
    pub taskspaces: Vec<TaskspaceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskspaceEntry {
    pub uuid: TaskspaceId,
    pub name: String,
    pub port: u16,
    #[serde(rename = "serverDataDir")]
    pub server_data_dir: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub extensions: ExtensionManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub hostname: String,
}

impl RosterSnapshot {
    pub fn capture(roster: &Roster, layout: &RemoteLayout) -> Self {
        Self {
            hostname: roster.hostname.clone(),
            active_task_space_uuid: roster.active(),
            taskspaces: roster
                .iter()
                .map(|t| TaskspaceEntry {
                    uuid: t.id,
                    name: t.name.clone(),
                    port: t.port,
                    server_data_dir: layout.server_data_dir(t.id).to_string_lossy().into_owned(),
                    last_seen: t.last_seen,
                    extensions: t.extensions.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds an in-memory roster. Every entry restores into `Cloned`
    /// with its previous last-known port; the lifecycle controller drops
    /// entries whose clone directory is gone before first use.
    pub fn restore(&self) -> Roster {
        let mut roster = Roster::new(self.hostname.clone());
        for entry in &self.taskspaces {
            let taskspace = Taskspace {
                id: entry.uuid,
                name: entry.name.clone(),
                description: None,
                state: TaskspaceState::Cloned,
                port: entry.port,
                extensions: entry.extensions.clone(),
                view_mode: Default::default(),
                attention: false,
                last_seen: entry.last_seen,
            };
            if roster.insert(taskspace).is_err() {
                warn!(event = "roster_duplicate_entry", uuid = %entry.uuid);
            }
        }
        if let Some(active) = self.active_task_space_uuid {
            let _ = roster.set_active(active);
        }
        roster
    }
}

/// Reads and writes the two local files under the per-user data directory.
/// Reads tolerate missing or corrupt files; writes are atomic
/// (tmp file + rename).
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open_default() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        Self { dir }
    }

    pub fn open_at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn roster_path(&self) -> PathBuf {
        self.dir.join(ROSTER_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub fn load_roster(&self) -> Option<RosterSnapshot> {
        self.load_json(&self.roster_path())
    }

    pub fn save_roster(&self, snapshot: &RosterSnapshot) -> Result<(), StorageError> {
        self.save_json(&self.roster_path(), snapshot)
    }

    pub fn load_settings(&self) -> Option<Settings> {
        self.load_json(&self.settings_path())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        self.save_json(&self.settings_path(), settings)
    }

    fn load_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(event = "storage_read_error", path = %path.display(), error = %err);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(event = "storage_parse_error", path = %path.display(), error = %err);
                None
            }
        }
    }

    fn save_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let body = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
