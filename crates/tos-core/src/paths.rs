use crate::taskspace::TaskspaceId;
use crate::{DEFAULT_BASE_DIR, SOCKET_FILE};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

const EDITOR_DIR: &str = "openvscode-server";
const EDITOR_ARCHIVE: &str = "openvscode-server.tar.gz";
const RUNTIME_DIR: &str = "switcheroo";
const RUNTIME_ARCHIVE: &str = "switcheroo-runtime.tar.gz";
const USER_DATA_DIR: &str = "vscode-user-data";
const WRAPPER_NAME: &str = "taskspace";

/// Remote filesystem layout under the base directory. Every taskspace path
/// is a pure function of the taskspace identifier, so a restarted controller
/// rediscovers them without any remote lookup.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    base: PathBuf,
}

impl RemoteLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Home-relative default; remote shells and scp both resolve it against
    /// the remote user's home directory.
    pub fn default_base() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn socket_path(&self) -> PathBuf {
        self.base.join(SOCKET_FILE)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.base.join("bin")
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.bin_dir().join(WRAPPER_NAME)
    }

    pub fn editor_root(&self) -> PathBuf {
        self.base.join(EDITOR_DIR)
    }

    pub fn editor_archive(&self) -> PathBuf {
        self.base.join(EDITOR_ARCHIVE)
    }

    pub fn editor_binary(&self) -> PathBuf {
        self.editor_root().join("bin").join("openvscode-server")
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.base.join(RUNTIME_DIR)
    }

    pub fn runtime_archive(&self) -> PathBuf {
        self.base.join(RUNTIME_ARCHIVE)
    }

    pub fn daemon_binary(&self) -> PathBuf {
        self.runtime_root().join("bin").join("tos-daemon")
    }

    pub fn cli_binary(&self) -> PathBuf {
        self.runtime_root().join("bin").join("tos-cli")
    }

    /// Shared across all taskspaces of the host, never mutated by the
    /// controller.
    pub fn user_data_dir(&self) -> PathBuf {
        self.base.join(USER_DATA_DIR)
    }

    pub fn taskspace_root(&self, id: TaskspaceId) -> PathBuf {
        self.base.join("taskspaces").join(id.to_string())
    }

    pub fn clone_dir(&self, id: TaskspaceId) -> PathBuf {
        self.taskspace_root(id).join("clone")
    }

    pub fn clone_script(&self, id: TaskspaceId) -> PathBuf {
        self.taskspace_root(id).join("fresh-clone.sh")
    }

    pub fn editor_data_root(&self, id: TaskspaceId) -> PathBuf {
        self.base.join("taskspaces").join(format!("taskspace-{id}"))
    }

    pub fn server_data_dir(&self, id: TaskspaceId) -> PathBuf {
        self.editor_data_root(id).join("server-data")
    }

    pub fn extensions_dir(&self, id: TaskspaceId) -> PathBuf {
        self.editor_data_root(id).join("extensions")
    }
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .expect("uuid pattern compiles")
    })
}

/// Derives a taskspace identifier from a filesystem path by matching the
/// first canonical UUID substring. CLI clients inside a taskspace use this
/// on their working directory; the directory scheme in `RemoteLayout` is
/// what makes the match reliable.
pub fn taskspace_id_from_path(path: &Path) -> Option<TaskspaceId> {
    let text = path.to_string_lossy();
    let found = uuid_pattern().find(&text)?;
    TaskspaceId::from_str(found.as_str()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_are_pure_functions_of_the_id() {
        let layout = RemoteLayout::default_base();
        let id = TaskspaceId::new();

        assert_eq!(layout.clone_dir(id), layout.clone_dir(id));
        assert_eq!(layout.server_data_dir(id), layout.server_data_dir(id));
        assert_eq!(layout.extensions_dir(id), layout.extensions_dir(id));

        let clone = layout.clone_dir(id);
        assert!(clone.ends_with(format!("taskspaces/{id}/clone")));
        let data = layout.server_data_dir(id);
        assert!(data.ends_with(format!("taskspaces/taskspace-{id}/server-data")));
        let ext = layout.extensions_dir(id);
        assert!(ext.ends_with(format!("taskspaces/taskspace-{id}/extensions")));
        let script = layout.clone_script(id);
        assert!(script.ends_with(format!("taskspaces/{id}/fresh-clone.sh")));
    }

    #[test]
    fn socket_lives_directly_under_base() {
        let layout = RemoteLayout::new("/srv/tos");
        assert_eq!(layout.socket_path(), PathBuf::from("/srv/tos/daemon.sock"));
    }

    #[test]
    fn extracts_id_from_clone_working_directory() {
        let layout = RemoteLayout::default_base();
        let id = TaskspaceId::new();
        let cwd = layout.clone_dir(id).join("src").join("deep");
        assert_eq!(taskspace_id_from_path(&cwd), Some(id));
    }

    #[test]
    fn extraction_is_case_insensitive() {
        let id: TaskspaceId = "7E6E4C12-9F00-4B3A-8D21-0A1B2C3D4E5F"
            .parse()
            .expect("parse");
        let path = PathBuf::from("/home/u/taskspaces/7E6E4C12-9F00-4B3A-8D21-0A1B2C3D4E5F/clone");
        assert_eq!(taskspace_id_from_path(&path), Some(id));
    }

    #[test]
    fn extraction_fails_without_a_uuid() {
        assert_eq!(taskspace_id_from_path(Path::new("/home/user/project")), None);
        assert_eq!(
            taskspace_id_from_path(Path::new("/home/user/1234-not-a-uuid")),
            None
        );
    }
}
