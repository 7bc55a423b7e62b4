//! The taskspace state machine and everything that drives it: provisioning,
//! server startup, port forwarding, restore, and the bus-event handlers the
//! router dispatches into.
//!
//! Transitions on one taskspace are serialized by a per-taskspace lock;
//! different taskspaces proceed in parallel at subordinate-process
//! granularity. Roster mutations happen under one short-lived lock and are
//! followed immediately by the roster-changed emission and the persistence
//! write, so observers always see a consistent snapshot.

use crate::install::{self, Arch};
use crate::server::{self, sh_quote};
use crate::surface::{RosterSummary, RosterSummaryEntry, ViewHandle, WorkbenchSurface};
use crate::ControlError;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tos_core::{
    ProgressCategory, RemoteLayout, Roster, Taskspace, TaskspaceId, TaskspaceState,
    TaskspaceStatusEntry, ViewMode,
};
use tos_storage::{RosterSnapshot, Store};
use tos_transport::{PortForward, RemoteProcess, Transport, TransportError};
use tracing::{debug, error, info, warn};

/// Project-level inputs for new taskspaces: the clone script and the
/// extensions every fresh editor gets.
#[derive(Debug, Clone, Default)]
pub struct ProjectSpec {
    pub clone_script: Option<PathBuf>,
    pub extensions: tos_core::ExtensionManifest,
    pub vsix_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub initial_prompt: Option<String>,
}

#[derive(Debug, Default)]
struct TaskspaceViews {
    editor: Option<ViewHandle>,
    meta: Option<ViewHandle>,
}

#[derive(Default)]
struct Inner {
    roster: Roster,
    forwards: HashMap<TaskspaceId, PortForward>,
    servers: HashMap<TaskspaceId, RemoteProcess>,
    views: HashMap<TaskspaceId, TaskspaceViews>,
    locks: HashMap<TaskspaceId, Arc<Mutex<()>>>,
}

pub struct Orchestrator {
    host: String,
    layout: RemoteLayout,
    transport: Arc<Transport>,
    surface: Arc<dyn WorkbenchSurface>,
    store: Store,
    project: ProjectSpec,
    http: reqwest::Client,
    inner: Mutex<Inner>,
    /// Terminal `show_error` is reserved for failures before the first
    /// taskspace ever runs; afterwards failures stay non-terminal.
    initial_boot: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        host: impl Into<String>,
        layout: RemoteLayout,
        transport: Arc<Transport>,
        surface: Arc<dyn WorkbenchSurface>,
        store: Store,
        project: ProjectSpec,
    ) -> Self {
        let host = host.into();
        Self {
            layout,
            transport,
            surface,
            store,
            project,
            http: reqwest::Client::new(),
            inner: Mutex::new(Inner {
                roster: Roster::new(host.clone()),
                ..Inner::default()
            }),
            initial_boot: AtomicBool::new(true),
            host,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn roster_is_empty(&self) -> bool {
        self.inner.lock().await.roster.is_empty()
    }

    pub async fn active_taskspace(&self) -> Option<TaskspaceId> {
        self.inner.lock().await.roster.active()
    }

    /// Brings the host up: channel, editor install, runtime bundle, bus
    /// daemon. Returns the daemon process whose stdio feeds the router.
    pub async fn bootstrap(&self) -> Result<RemoteProcess, ControlError> {
        match self.bootstrap_inner().await {
            Ok(daemon) => Ok(daemon),
            Err(err) => {
                if self.initial_boot.load(Ordering::Relaxed) {
                    self.surface.show_error(
                        "Startup failed",
                        &format!("Could not prepare {}", self.host),
                        Some(&err.to_string()),
                    );
                }
                Err(err)
            }
        }
    }

    async fn bootstrap_inner(&self) -> Result<RemoteProcess, ControlError> {
        self.surface
            .update_progress(&format!("Connecting to {}...", self.host));
        self.transport.ensure_channel(&self.host).await?;

        let arch = install::detect_arch(&self.transport, &self.host).await?;
        self.install_editor_and_runtime(arch).await?;

        self.surface.update_progress("Starting event bus...");
        install::start_daemon(&self.transport, &self.host, &self.layout).await
    }

    async fn install_editor_and_runtime(&self, arch: Arch) -> Result<(), ControlError> {
        self.surface.update_progress(&format!(
            "Installing editor {} ({})...",
            install::EDITOR_VERSION,
            arch.tag()
        ));
        install::install_editor(&self.transport, &self.host, &self.layout, arch).await?;

        self.surface.update_progress("Installing taskspace runtime...");
        install::install_runtime(&self.transport, &self.host, &self.layout, arch).await
    }

    /// Reads the persisted roster, drops entries whose clone directory is
    /// gone, and restores survivors into `Cloned` with their previous
    /// last-known port.
    pub async fn restore(&self) -> Result<(), ControlError> {
        let snapshot = match self.store.load_roster() {
            Some(snapshot) if snapshot.hostname == self.host => snapshot,
            Some(snapshot) => {
                warn!(
                    event = "roster_host_mismatch",
                    persisted = %snapshot.hostname,
                    configured = %self.host
                );
                let mut inner = self.inner.lock().await;
                inner.roster = Roster::new(self.host.clone());
                self.notify_and_persist(&inner);
                return Ok(());
            }
            None => {
                let mut inner = self.inner.lock().await;
                inner.roster = Roster::new(self.host.clone());
                self.notify_and_persist(&inner);
                return Ok(());
            }
        };

        let previous_active = snapshot.active_task_space_uuid;
        let mut kept = Roster::new(self.host.clone());

        for taskspace in snapshot.restore().iter() {
            let clone_dir = sh_quote(&self.layout.clone_dir(taskspace.id).to_string_lossy());
            match self
                .transport
                .execute(&self.host, &format!("test -d {clone_dir}"))
                .await
            {
                Ok(_) => {
                    let _ = kept.insert(taskspace.clone());
                }
                Err(TransportError::RemoteCommand { code: 1, .. }) => {
                    info!(event = "restore_dropped_taskspace", uuid = %taskspace.id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(active) = previous_active {
            if kept.contains(active) {
                let _ = kept.set_active(active);
            }
        }
        if kept.active().is_none() {
            if let Some(first) = kept.first_id() {
                let _ = kept.set_active(first);
            }
        }

        info!(event = "roster_restored", taskspaces = kept.len());
        let mut inner = self.inner.lock().await;
        inner.roster = kept;
        self.notify_and_persist(&inner);
        Ok(())
    }

    /// Absent -> Provisioning -> Cloned. A failed clone reverts the entry
    /// to Absent in memory and on disk.
    pub async fn create_taskspace(
        &self,
        request: CreateRequest,
    ) -> Result<TaskspaceId, ControlError> {
        let mut taskspace = Taskspace::new(request.name.clone());
        taskspace.description = request.description.clone();
        taskspace.extensions = self.project.extensions.clone();
        let id = taskspace.id;

        {
            let mut inner = self.inner.lock().await;
            if inner.roster.insert(taskspace).is_err() {
                return Err(ControlError::Provisioning {
                    name: request.name,
                    detail: format!("identifier collision on {id}"),
                });
            }
            self.notify_and_persist(&inner);
        }

        self.surface
            .update_progress(&format!("Provisioning taskspace '{}'...", request.name));

        let lock = self.transition_lock(id).await;
        let _guard = lock.lock().await;

        match self.provision(id, &request).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.roster.get_mut(id) {
                    entry.state = TaskspaceState::Cloned;
                    entry.last_seen = Utc::now();
                }
                self.notify_and_persist(&inner);
                info!(event = "taskspace_provisioned", uuid = %id, name = %request.name);
                Ok(id)
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.roster.remove(id);
                inner.locks.remove(&id);
                self.notify_and_persist(&inner);
                let err = match err {
                    ControlError::Provisioning { .. } => err,
                    other => ControlError::Provisioning {
                        name: request.name,
                        detail: other.to_string(),
                    },
                };
                warn!(event = "provisioning_failed", uuid = %id, error = %err);
                Err(err)
            }
        }
    }

    async fn provision(&self, id: TaskspaceId, request: &CreateRequest) -> Result<(), ControlError> {
        let root = sh_quote(&self.layout.taskspace_root(id).to_string_lossy());
        self.transport
            .execute(&self.host, &format!("mkdir -p {root}"))
            .await?;

        let script_path = self.layout.clone_script(id);
        match &self.project.clone_script {
            Some(local) => {
                self.transport
                    .upload(&self.host, local, &script_path)
                    .await?;
            }
            None => {
                // No project script configured: the clone root still has to
                // exist for the editor's default folder.
                let script = sh_quote(&script_path.to_string_lossy());
                self.transport
                    .execute(
                        &self.host,
                        &format!(
                            "printf '#!/bin/sh\\nset -e\\nmkdir -p clone\\n' > {script}"
                        ),
                    )
                    .await?;
            }
        }

        if let Some(prompt) = &request.initial_prompt {
            let prompt_path =
                sh_quote(&self.layout.taskspace_root(id).join("initial-prompt").to_string_lossy());
            self.transport
                .execute(
                    &self.host,
                    &format!("printf %s {} > {prompt_path}", sh_quote(prompt)),
                )
                .await?;
        }

        self.transport
            .execute(&self.host, &format!("cd {root} && sh ./fresh-clone.sh"))
            .await?;

        let clone_dir = sh_quote(&self.layout.clone_dir(id).to_string_lossy());
        self.transport
            .execute(&self.host, &format!("test -d {clone_dir}"))
            .await
            .map_err(|err| ControlError::Provisioning {
                name: request.name.clone(),
                detail: format!("clone directory missing after clone script: {err}"),
            })?;
        Ok(())
    }

    /// Focus makes a taskspace active, clears its attention flag, and
    /// drives it toward Running.
    pub async fn focus_taskspace(&self, id: TaskspaceId) -> Result<(), ControlError> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.roster.contains(id) {
                return Err(ControlError::UnknownTaskspace(id));
            }
            let _ = inner.roster.set_active(id);
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.attention = false;
            }
            self.notify_and_persist(&inner);
        }
        self.ensure_running(id).await
    }

    /// Cloned/Stale -> Starting -> Running, or a probe of the last-known
    /// port when one exists. Serialized per taskspace.
    pub async fn ensure_running(&self, id: TaskspaceId) -> Result<(), ControlError> {
        let lock = self.transition_lock(id).await;
        let _guard = lock.lock().await;

        let (state, port, name) = {
            let inner = self.inner.lock().await;
            let entry = inner
                .roster
                .get(id)
                .ok_or(ControlError::UnknownTaskspace(id))?;
            (entry.state, entry.port, entry.name.clone())
        };

        match state {
            TaskspaceState::Running => {
                self.present_view(id).await;
                Ok(())
            }
            TaskspaceState::Cloned if port != 0 => {
                self.surface
                    .update_progress(&format!("Reconnecting to '{name}' on port {port}..."));
                match self.resume_on_port(id, port).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        debug!(event = "last_known_port_stale", uuid = %id, port, error = %err);
                        {
                            let mut inner = self.inner.lock().await;
                            if let Some(entry) = inner.roster.get_mut(id) {
                                entry.state = TaskspaceState::Stale;
                            }
                            self.notify_and_persist(&inner);
                        }
                        self.start_server(id).await
                    }
                }
            }
            TaskspaceState::Cloned | TaskspaceState::Stale => self.start_server(id).await,
            // Provisioning cannot be observed here while the transition
            // lock is held; nothing to do either way.
            TaskspaceState::Provisioning | TaskspaceState::Starting => Ok(()),
        }
    }

    /// One quick probe through a fresh forward on the last-known port. On
    /// success the taskspace is Running without a server restart.
    async fn resume_on_port(&self, id: TaskspaceId, port: u16) -> Result<(), ControlError> {
        let forward = self.transport.forward_port(&self.host, port, port).await?;
        server::probe_editor(&self.http, port, 1).await?;

        {
            let mut inner = self.inner.lock().await;
            inner.forwards.insert(id, forward);
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.state = TaskspaceState::Running;
                entry.last_seen = Utc::now();
            }
            self.notify_and_persist(&inner);
        }
        self.initial_boot.store(false, Ordering::Relaxed);
        self.present_view(id).await;
        Ok(())
    }

    /// Launches the editor server, scrapes its port, forwards it locally,
    /// and probes it healthy. Failure semantics: no port within the
    /// startup timeout -> Cloned with the port cleared; probe failure
    /// after the port was seen -> Stale.
    async fn start_server(&self, id: TaskspaceId) -> Result<(), ControlError> {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner
                .roster
                .get(id)
                .cloned()
                .ok_or(ControlError::UnknownTaskspace(id))?
        };
        let name = snapshot.name.clone();

        for vsix in &self.project.vsix_files {
            let Some(file_name) = vsix.file_name() else {
                warn!(event = "vsix_without_file_name", path = %vsix.display());
                continue;
            };
            let remote = self.layout.taskspace_root(id).join(file_name);
            self.transport.upload(&self.host, vsix, &remote).await?;
        }

        {
            let mut inner = self.inner.lock().await;
            // The old forward dies before the port can change under it.
            inner.forwards.remove(&id);
            inner.servers.remove(&id);
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.state = TaskspaceState::Starting;
            }
            self.notify_and_persist(&inner);
        }
        self.surface
            .update_progress(&format!("Starting editor server for '{name}'..."));

        let script = server::build_launch_script(&self.layout, &snapshot);
        let mut process = self.transport.execute_streaming(&self.host, &script).await?;

        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(event = "server_stderr", line = %line);
                }
            });
        }

        let Some(stdout) = process.take_stdout() else {
            let _ = process.start_kill();
            let err = ControlError::StartupFailed {
                detail: "server stdout unavailable".to_string(),
            };
            self.fail_to_cloned(id, &name, &err).await;
            return Err(err);
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let port = match server::discover_port(&mut stdout_lines, server::STARTUP_TIMEOUT).await {
            Ok(port) => port,
            Err(err) => {
                let _ = process.start_kill();
                self.fail_to_cloned(id, &name, &err).await;
                return Err(err);
            }
        };
        tokio::spawn(async move {
            while let Ok(Some(line)) = stdout_lines.next_line().await {
                debug!(event = "server_stdout", line = %line);
            }
        });
        info!(event = "server_port_discovered", uuid = %id, port);

        let forward = match self.transport.forward_port(&self.host, port, port).await {
            Ok(forward) => forward,
            Err(err) => {
                let _ = process.start_kill();
                let err = ControlError::from(err);
                self.fail_to_cloned(id, &name, &err).await;
                return Err(err);
            }
        };

        // The fresh port replaces the last-known port in memory first;
        // a failed persistence write is surfaced but never undoes it.
        {
            let mut inner = self.inner.lock().await;
            inner.forwards.insert(id, forward);
            inner.servers.insert(id, process);
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.port = port;
                entry.last_seen = Utc::now();
            }
            self.notify_and_persist(&inner);
        }

        self.surface
            .update_progress(&format!("Waiting for '{name}' on port {port}..."));
        if let Err(err) = server::probe_editor(&self.http, port, server::PROBE_MAX_ATTEMPTS).await {
            {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.roster.get_mut(id) {
                    entry.state = TaskspaceState::Stale;
                }
                self.notify_and_persist(&inner);
            }
            self.report_failure(&name, &err);
            return Err(err);
        }

        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.state = TaskspaceState::Running;
                entry.last_seen = Utc::now();
            }
            self.notify_and_persist(&inner);
        }
        self.initial_boot.store(false, Ordering::Relaxed);
        info!(event = "taskspace_running", uuid = %id, port);
        self.present_view(id).await;
        Ok(())
    }

    async fn fail_to_cloned(&self, id: TaskspaceId, name: &str, err: &ControlError) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.state = TaskspaceState::Cloned;
                entry.port = 0;
            }
            self.notify_and_persist(&inner);
        }
        self.report_failure(name, err);
    }

    fn report_failure(&self, name: &str, err: &ControlError) {
        self.surface
            .update_progress(&format!("Failed to start '{name}': {err}"));
        if self.initial_boot.load(Ordering::Relaxed) {
            self.surface.show_error(
                "Startup failed",
                &format!("Could not start the editor for '{name}'"),
                Some(&err.to_string()),
            );
        }
    }

    /// Tears down the local forward and server subordinate, removes the
    /// roster entry, and reclaims the remote taskspace directories.
    pub async fn delete_taskspace(&self, id: TaskspaceId) -> Result<(), ControlError> {
        let lock = self.transition_lock(id).await;
        let _guard = lock.lock().await;

        {
            let mut inner = self.inner.lock().await;
            if inner.roster.remove(id).is_none() {
                return Err(ControlError::UnknownTaskspace(id));
            }
            inner.forwards.remove(&id);
            if let Some(mut process) = inner.servers.remove(&id) {
                let _ = process.start_kill();
            }
            inner.views.remove(&id);
            self.notify_and_persist(&inner);
        }

        let root = sh_quote(&self.layout.taskspace_root(id).to_string_lossy());
        let data = sh_quote(&self.layout.editor_data_root(id).to_string_lossy());
        self.transport
            .execute(&self.host, &format!("rm -rf {root} {data}"))
            .await?;

        let mut inner = self.inner.lock().await;
        inner.locks.remove(&id);
        info!(event = "taskspace_removed", uuid = %id);
        Ok(())
    }

    /// Flips between the editor and meta views, creating handles lazily
    /// through the surface.
    pub async fn toggle_view_mode(&self, id: TaskspaceId) -> Result<(), ControlError> {
        {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .roster
                .get_mut(id)
                .ok_or(ControlError::UnknownTaskspace(id))?;
            entry.view_mode = match entry.view_mode {
                ViewMode::Editor => ViewMode::Meta,
                ViewMode::Meta => ViewMode::Editor,
            };
        }
        self.present_view(id).await;
        Ok(())
    }

    async fn present_view(&self, id: TaskspaceId) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.roster.get(id) else {
            return;
        };
        let port = entry.port;
        let mode = entry.view_mode;
        let partition = format!("persist:taskspace-{id}");
        let clone_dir = self.layout.clone_dir(id);

        let views = inner.views.entry(id).or_default();
        let handle = match mode {
            ViewMode::Editor => *views.editor.get_or_insert_with(|| {
                self.surface
                    .create_editor_view(&partition, &editor_url(port, &clone_dir))
            }),
            ViewMode::Meta => *views
                .meta
                .get_or_insert_with(|| self.surface.create_meta_view(&partition)),
        };
        self.surface.present(&handle);
    }

    pub async fn status_summary(&self) -> (Vec<TaskspaceStatusEntry>, Option<TaskspaceId>) {
        let inner = self.inner.lock().await;
        let entries = inner
            .roster
            .iter()
            .map(|entry| TaskspaceStatusEntry {
                name: entry.name.clone(),
                status: entry.state.to_string(),
                uuid: entry.id,
            })
            .collect();
        (entries, inner.roster.active())
    }

    /// `update_taskspace` handler: rename/re-describe and persist.
    pub async fn rename_taskspace(
        &self,
        id: TaskspaceId,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().await;
        {
            let entry = inner
                .roster
                .get_mut(id)
                .ok_or(ControlError::UnknownTaskspace(id))?;
            if let Some(name) = name {
                entry.name = name;
            }
            if let Some(description) = description {
                entry.description = Some(description);
            }
            entry.last_seen = Utc::now();
        }
        self.notify_and_persist(&inner);
        Ok(())
    }

    /// `progress_log` handler. A question asks for attention like a user
    /// signal does.
    pub async fn record_progress(
        &self,
        message: &str,
        category: ProgressCategory,
        uuid: Option<TaskspaceId>,
    ) {
        let mut inner = self.inner.lock().await;
        let attributed = uuid.and_then(|id| inner.roster.get(id).map(|entry| entry.name.clone()));
        match &attributed {
            Some(name) => self
                .surface
                .update_progress(&format!("[{name}] {message}")),
            None => self.surface.update_progress(message),
        }
        info!(event = "progress_log", category = %category, message);

        if category == ProgressCategory::Question {
            let mut changed = false;
            if let Some(id) = uuid {
                if let Some(entry) = inner.roster.get_mut(id) {
                    entry.attention = true;
                    changed = true;
                }
            }
            if changed {
                self.notify_and_persist(&inner);
            }
        }
    }

    /// `user_signal` handler: mark the taskspace as wanting attention.
    pub async fn record_user_signal(&self, message: &str, uuid: Option<TaskspaceId>) {
        let mut inner = self.inner.lock().await;
        let mut changed = false;
        let attributed = uuid.and_then(|id| inner.roster.get(id).map(|entry| entry.name.clone()));
        if let Some(id) = uuid {
            if let Some(entry) = inner.roster.get_mut(id) {
                entry.attention = true;
                changed = true;
            }
        }
        match &attributed {
            Some(name) => self
                .surface
                .update_progress(&format!("[{name}] wants attention: {message}")),
            None => self
                .surface
                .update_progress(&format!("Attention requested: {message}")),
        }
        info!(event = "user_signal", message);
        if changed {
            self.notify_and_persist(&inner);
        }
    }

    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.forwards.clear();
            for (_, mut process) in inner.servers.drain() {
                let _ = process.start_kill();
            }
        }
        self.transport.shutdown_all().await;
    }

    async fn transition_lock(&self, id: TaskspaceId) -> Arc<Mutex<()>> {
        let mut inner = self.inner.lock().await;
        inner.locks.entry(id).or_default().clone()
    }

    /// Roster-changed emission first, then the atomic write. A failed
    /// write is logged and surfaced but never blocks the UI update.
    fn notify_and_persist(&self, inner: &Inner) {
        let summary = RosterSummary {
            hostname: inner.roster.hostname.clone(),
            active: inner.roster.active(),
            entries: inner
                .roster
                .iter()
                .map(|entry| RosterSummaryEntry {
                    id: entry.id,
                    name: entry.name.clone(),
                    state: entry.state,
                    port: entry.port,
                    attention: entry.attention,
                })
                .collect(),
        };
        self.surface.roster_changed(&summary);

        let snapshot = RosterSnapshot::capture(&inner.roster, &self.layout);
        if let Err(err) = self.store.save_roster(&snapshot) {
            error!(event = "roster_persist_failed", error = %err);
            self.surface
                .update_progress(&format!("Warning: could not save taskspace roster: {err}"));
        }
    }

    #[cfg(test)]
    pub(crate) async fn adopt_roster(&self, roster: Roster) {
        let mut inner = self.inner.lock().await;
        inner.roster = roster;
        self.notify_and_persist(&inner);
    }
}

fn editor_url(port: u16, folder: &Path) -> String {
    match url::Url::parse(&format!("http://localhost:{port}/")) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("folder", &folder.to_string_lossy());
            url.to_string()
        }
        Err(_) => format!("http://localhost:{port}/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::testing::RecordingSurface;

    fn test_store(tag: &str) -> Store {
        Store::open_at(std::env::temp_dir().join(format!(
            "tos-lifecycle-{tag}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        )))
    }

    fn orchestrator(tag: &str) -> (Arc<Orchestrator>, Arc<RecordingSurface>, Store) {
        let surface = Arc::new(RecordingSurface::new());
        let store = test_store(tag);
        let orchestrator = Arc::new(Orchestrator::new(
            "devbox-1",
            RemoteLayout::default_base(),
            Arc::new(Transport::new().expect("transport")),
            surface.clone(),
            store.clone(),
            ProjectSpec::default(),
        ));
        (orchestrator, surface, store)
    }

    fn seeded_roster() -> (Roster, TaskspaceId) {
        let mut roster = Roster::new("devbox-1");
        let mut taskspace = Taskspace::new("alpha");
        taskspace.state = TaskspaceState::Cloned;
        taskspace.port = 45137;
        let id = taskspace.id;
        roster.insert(taskspace).expect("insert");
        roster.set_active(id).expect("active");
        (roster, id)
    }

    #[tokio::test]
    async fn rename_updates_roster_and_disk() {
        let (orchestrator, _surface, store) = orchestrator("rename");
        let (roster, id) = seeded_roster();
        orchestrator.adopt_roster(roster).await;

        orchestrator
            .rename_taskspace(id, Some("Alpha".to_string()), None)
            .await
            .expect("rename");

        let (entries, active) = orchestrator.status_summary().await;
        assert_eq!(entries[0].name, "Alpha");
        assert_eq!(active, Some(id));

        let persisted = store.load_roster().expect("snapshot on disk");
        assert_eq!(persisted.taskspaces[0].name, "Alpha");
        assert_eq!(persisted.taskspaces[0].port, 45137);
    }

    #[tokio::test]
    async fn rename_of_unknown_taskspace_fails() {
        let (orchestrator, _surface, _store) = orchestrator("rename-unknown");
        let stranger = TaskspaceId::new();
        let err = orchestrator
            .rename_taskspace(stranger, Some("x".to_string()), None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ControlError::UnknownTaskspace(id) if id == stranger));
    }

    #[tokio::test]
    async fn status_summary_reflects_state_and_active() {
        let (orchestrator, _surface, _store) = orchestrator("summary");
        let (roster, id) = seeded_roster();
        orchestrator.adopt_roster(roster).await;

        let (entries, active) = orchestrator.status_summary().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "cloned");
        assert_eq!(entries[0].uuid, id);
        assert_eq!(active, Some(id));
    }

    #[tokio::test]
    async fn user_signal_sets_attention_and_notifies() {
        let (orchestrator, surface, _store) = orchestrator("signal");
        let (roster, id) = seeded_roster();
        orchestrator.adopt_roster(roster).await;

        orchestrator
            .record_user_signal("need review", Some(id))
            .await;

        let calls = surface.calls();
        assert!(calls
            .iter()
            .any(|c| c.contains("[alpha] wants attention: need review")));
        // Attention is a roster change; the last roster_changed comes after
        // the signal.
        assert!(calls.iter().rev().any(|c| c.starts_with("roster_changed")));
    }

    #[tokio::test]
    async fn question_progress_marks_attention() {
        let (orchestrator, surface, _store) = orchestrator("question");
        let (roster, id) = seeded_roster();
        orchestrator.adopt_roster(roster).await;

        orchestrator
            .record_progress("which branch?", ProgressCategory::Question, Some(id))
            .await;
        orchestrator
            .record_progress("building", ProgressCategory::Info, None)
            .await;

        let calls = surface.calls();
        assert!(calls.iter().any(|c| c.contains("[alpha] which branch?")));
        assert!(calls.iter().any(|c| c == "progress: building"));
    }

    #[tokio::test]
    async fn focus_clears_attention_flag() {
        let (orchestrator, _surface, store) = orchestrator("focus-attention");
        let (mut roster, id) = seeded_roster();
        roster.get_mut(id).unwrap().attention = true;
        // Running state keeps focus_taskspace away from the transport.
        roster.get_mut(id).unwrap().state = TaskspaceState::Running;
        orchestrator.adopt_roster(roster).await;

        orchestrator.focus_taskspace(id).await.expect("focus");

        let persisted = store.load_roster().expect("snapshot");
        assert_eq!(persisted.active_task_space_uuid, Some(id));
        let (entries, _) = orchestrator.status_summary().await;
        assert_eq!(entries[0].status, "running");
    }

    #[tokio::test]
    async fn editor_url_points_at_the_clone() {
        let url = editor_url(45137, Path::new(".theoldswitcheroo/taskspaces/x/clone"));
        assert!(url.starts_with("http://localhost:45137/?folder="));
        assert!(url.contains("clone"));
    }
}
