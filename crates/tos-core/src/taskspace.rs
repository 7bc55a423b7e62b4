use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Taskspace identifier, rendered in the canonical 8-4-4-4-12 form
/// everywhere: wire events, persisted roster, remote directory names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskspaceId(Uuid);

impl TaskspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

impl FromStr for TaskspaceId {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(input.trim())
            .map(Self)
            .map_err(|err| format!("invalid taskspace id '{input}': {err}"))
    }
}

impl From<Uuid> for TaskspaceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskspaceState {
    Provisioning,
    Cloned,
    Starting,
    Running,
    Stale,
}

impl TaskspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskspaceState::Provisioning => "provisioning",
            TaskspaceState::Cloned => "cloned",
            TaskspaceState::Starting => "starting",
            TaskspaceState::Running => "running",
            TaskspaceState::Stale => "stale",
        }
    }
}

impl fmt::Display for TaskspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskspaceState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "provisioning" => Ok(TaskspaceState::Provisioning),
            "cloned" => Ok(TaskspaceState::Cloned),
            "starting" => Ok(TaskspaceState::Starting),
            "running" => Ok(TaskspaceState::Running),
            "stale" => Ok(TaskspaceState::Stale),
            other => Err(format!("unknown taskspace state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Editor,
    Meta,
}

impl Default for ViewMode {
    fn default() -> Self {
        Self::Editor
    }
}

/// Extensions to install when a taskspace's editor server first starts:
/// marketplace identifiers and uploaded `.vsix` file names, both ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    #[serde(default)]
    pub marketplace: Vec<String>,
    #[serde(default)]
    pub vsix: Vec<String>,
}

impl ExtensionManifest {
    pub fn is_empty(&self) -> bool {
        self.marketplace.is_empty() && self.vsix.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Taskspace {
    pub id: TaskspaceId,
    pub name: String,
    pub description: Option<String>,
    pub state: TaskspaceState,
    /// Last-known editor-server port. 0 means the server never started.
    pub port: u16,
    pub extensions: ExtensionManifest,
    pub view_mode: ViewMode,
    /// Set by `user_signal` events and question-category progress until the
    /// taskspace is next focused.
    pub attention: bool,
    pub last_seen: DateTime<Utc>,
}

impl Taskspace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskspaceId::new(),
            name: name.into(),
            description: None,
            state: TaskspaceState::Provisioning,
            port: 0,
            extensions: ExtensionManifest::default(),
            view_mode: ViewMode::default(),
            attention: false,
            last_seen: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("taskspace {0} already present in roster")]
    Duplicate(TaskspaceId),
    #[error("taskspace {0} not in roster")]
    NotFound(TaskspaceId),
}

/// Ordered collection of taskspaces plus the active identifier.
/// Invariants: identifiers unique; the active identifier, when set, names a
/// member.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub hostname: String,
    active: Option<TaskspaceId>,
    taskspaces: Vec<Taskspace>,
}

impl Roster {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            active: None,
            taskspaces: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Taskspace> {
        self.taskspaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Taskspace> {
        self.taskspaces.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.taskspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taskspaces.is_empty()
    }

    pub fn contains(&self, id: TaskspaceId) -> bool {
        self.taskspaces.iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: TaskspaceId) -> Option<&Taskspace> {
        self.taskspaces.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskspaceId) -> Option<&mut Taskspace> {
        self.taskspaces.iter_mut().find(|t| t.id == id)
    }

    pub fn insert(&mut self, taskspace: Taskspace) -> Result<(), RosterError> {
        if self.contains(taskspace.id) {
            return Err(RosterError::Duplicate(taskspace.id));
        }
        self.taskspaces.push(taskspace);
        Ok(())
    }

    /// Removes a taskspace, clearing the active identifier when it pointed
    /// at the removed entry.
    pub fn remove(&mut self, id: TaskspaceId) -> Option<Taskspace> {
        let index = self.taskspaces.iter().position(|t| t.id == id)?;
        if self.active == Some(id) {
            self.active = None;
        }
        Some(self.taskspaces.remove(index))
    }

    pub fn active(&self) -> Option<TaskspaceId> {
        self.active
    }

    pub fn set_active(&mut self, id: TaskspaceId) -> Result<(), RosterError> {
        if !self.contains(id) {
            return Err(RosterError::NotFound(id));
        }
        self.active = Some(id);
        Ok(())
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn first_id(&self) -> Option<TaskspaceId> {
        self.taskspaces.first().map(|t| t.id)
    }
}
