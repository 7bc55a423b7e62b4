pub mod event;
pub mod paths;
pub mod ports;
pub mod taskspace;

pub use event::{BusEvent, EventRecord, ProgressCategory, TaskspaceStatusEntry};
pub use paths::{taskspace_id_from_path, RemoteLayout};
pub use ports::scrape_port;
pub use taskspace::{
    ExtensionManifest, Roster, RosterError, Taskspace, TaskspaceId, TaskspaceState, ViewMode,
};

/// Overrides the remote base directory for every component that derives
/// paths from it (controller, daemon, CLI).
pub const BASE_DIR_ENV: &str = "BASE_DIR";

/// Overrides the bus-daemon socket path on the remote side.
pub const SOCKET_ENV: &str = "THEOLDSWITCHEROO_SOCKET";

/// Remote base directory relative to the remote user's home.
pub const DEFAULT_BASE_DIR: &str = ".theoldswitcheroo";

/// Socket file name under the base directory. The file's presence is the
/// daemon liveness signal; deleting it is the handoff request.
pub const SOCKET_FILE: &str = "daemon.sock";
