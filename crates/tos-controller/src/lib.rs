//! Desktop-side orchestration core: taskspace lifecycle, bus-event routing,
//! and the narrow contract against the UI collaborator. Everything here is
//! headless; rendering belongs to whoever implements
//! [`surface::WorkbenchSurface`].

pub mod install;
pub mod lifecycle;
pub mod router;
pub mod server;
pub mod surface;

pub use lifecycle::{CreateRequest, Orchestrator, ProjectSpec};
pub use surface::{HeadlessSurface, RosterSummary, RosterSummaryEntry, ViewHandle, WorkbenchSurface};

use thiserror::Error;
use tos_core::TaskspaceId;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Transport(#[from] tos_transport::TransportError),
    #[error("provisioning {name} failed: {detail}")]
    Provisioning { name: String, detail: String },
    #[error("editor server announced no port within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },
    #[error("editor server failed during startup: {detail}")]
    StartupFailed { detail: String },
    #[error("health probe on port {port} failed after {attempts} attempts")]
    ProbeFailed { port: u16, attempts: u32 },
    #[error("taskspace {0} not in roster")]
    UnknownTaskspace(TaskspaceId),
    #[error("persistence error: {0}")]
    Persistence(#[from] tos_storage::StorageError),
}
