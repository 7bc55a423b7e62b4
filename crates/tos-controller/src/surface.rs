use std::sync::atomic::{AtomicU64, Ordering};
use tos_core::{TaskspaceId, TaskspaceState};
use tracing::{error, info};

/// Opaque token for a view the UI collaborator constructed. The core
/// stores and passes these around but never inspects or disposes them;
/// their lifetime belongs to the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewHandle(u64);

impl ViewHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSummaryEntry {
    pub id: TaskspaceId,
    pub name: String,
    pub state: TaskspaceState,
    pub port: u16,
    pub attention: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterSummary {
    pub hostname: String,
    pub active: Option<TaskspaceId>,
    pub entries: Vec<RosterSummaryEntry>,
}

/// What the lifecycle needs from whatever renders it. Progress is
/// advisory and fire-and-forget; `show_error` is terminal and leaves the
/// main view on the error surface.
pub trait WorkbenchSurface: Send + Sync {
    fn update_progress(&self, message: &str);
    fn show_error(&self, title: &str, message: &str, details: Option<&str>);
    fn present(&self, view: &ViewHandle);
    fn create_editor_view(&self, partition: &str, initial_url: &str) -> ViewHandle;
    fn create_meta_view(&self, partition: &str) -> ViewHandle;
    fn roster_changed(&self, roster: &RosterSummary);
}

/// Tracing-backed surface for running without the desktop shell.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    next_handle: AtomicU64,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkbenchSurface for HeadlessSurface {
    fn update_progress(&self, message: &str) {
        info!(event = "progress", message);
    }

    fn show_error(&self, title: &str, message: &str, details: Option<&str>) {
        error!(event = "terminal_error", title, message, details = details.unwrap_or(""));
    }

    fn present(&self, view: &ViewHandle) {
        info!(event = "present", view = view.raw());
    }

    fn create_editor_view(&self, partition: &str, initial_url: &str) -> ViewHandle {
        let handle = ViewHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info!(event = "editor_view", partition, url = initial_url, view = handle.raw());
        handle
    }

    fn create_meta_view(&self, partition: &str) -> ViewHandle {
        let handle = ViewHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info!(event = "meta_view", partition, view = handle.raw());
        handle
    }

    fn roster_changed(&self, roster: &RosterSummary) {
        info!(
            event = "roster_changed",
            hostname = %roster.hostname,
            taskspaces = roster.entries.len(),
            active = %roster.active.map(|id| id.to_string()).unwrap_or_default()
        );
    }
}
