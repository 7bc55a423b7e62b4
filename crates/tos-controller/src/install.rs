//! Remote installation: the pinned editor build, the runtime bundle that
//! carries the bus daemon and CLI, and daemon startup with handoff.
//!
//! Every install step is gated on plain file existence, so reruns after a
//! controller restart are no-ops.

use crate::server::sh_quote;
use crate::ControlError;
use std::time::Duration;
use tos_core::RemoteLayout;
use tos_transport::{RemoteProcess, Transport};
use tracing::{info, warn};

pub const EDITOR_VERSION: &str = "1.95.3";
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long an incumbent daemon gets to notice socket deletion and release
/// the host before the new daemon starts.
const HANDOFF_WAIT: Duration = Duration::from_secs(2);

const WRAPPER_BODY: &str = r#"#!/bin/sh
BASE_DIR="${BASE_DIR:-$HOME/.theoldswitcheroo}"
export BASE_DIR
THEOLDSWITCHEROO_SOCKET="${THEOLDSWITCHEROO_SOCKET:-$BASE_DIR/daemon.sock}"
export THEOLDSWITCHEROO_SOCKET
exec "$BASE_DIR/switcheroo/bin/tos-cli" "$@"
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn tag(self) -> &'static str {
        match self {
            Arch::X64 => "linux-x64",
            Arch::Arm64 => "linux-arm64",
        }
    }

    pub fn from_uname(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" => Arch::X64,
            "aarch64" | "arm64" => Arch::Arm64,
            other => {
                warn!(event = "unknown_arch", machine = other, fallback = "linux-x64");
                Arch::X64
            }
        }
    }
}

pub async fn detect_arch(transport: &Transport, host: &str) -> Result<Arch, ControlError> {
    let machine = transport.execute(host, "uname -m").await?;
    Ok(Arch::from_uname(&machine))
}

fn editor_url(arch: Arch) -> String {
    format!(
        "https://github.com/gitpod-io/openvscode-server/releases/download/\
openvscode-server-v{EDITOR_VERSION}/openvscode-server-v{EDITOR_VERSION}-{}.tar.gz",
        arch.tag()
    )
}

fn runtime_url(arch: Arch) -> String {
    format!(
        "https://github.com/theoldswitcheroo/theoldswitcheroo/releases/download/\
v{RUNTIME_VERSION}/switcheroo-runtime-{RUNTIME_VERSION}-{}.tar.gz",
        arch.tag()
    )
}

/// Download-if-archive-missing, unpack-if-directory-missing, then chmod.
pub fn editor_install_script(layout: &RemoteLayout, arch: Arch) -> String {
    let base = sh_quote(&layout.base().to_string_lossy());
    let archive = sh_quote(&layout.editor_archive().to_string_lossy());
    let root = sh_quote(&layout.editor_root().to_string_lossy());
    let binary = sh_quote(&layout.editor_binary().to_string_lossy());
    let url = sh_quote(&editor_url(arch));

    format!(
        "set -e\n\
mkdir -p {base}\n\
if [ ! -f {archive} ]; then curl -fsSL {url} -o {archive}; fi\n\
if [ ! -d {root} ]; then mkdir -p {root} && tar -xzf {archive} -C {root} --strip-components=1; fi\n\
chmod +x {binary}\n"
    )
}

/// Same gate pattern for the daemon/CLI bundle, plus the `bin/taskspace`
/// wrapper that exports the base-dir and socket environment so taskspace
/// processes can reach the bus without any setup of their own.
pub fn runtime_install_script(layout: &RemoteLayout, arch: Arch) -> String {
    let base = sh_quote(&layout.base().to_string_lossy());
    let bin_dir = sh_quote(&layout.bin_dir().to_string_lossy());
    let archive = sh_quote(&layout.runtime_archive().to_string_lossy());
    let root = sh_quote(&layout.runtime_root().to_string_lossy());
    let wrapper = sh_quote(&layout.wrapper_path().to_string_lossy());
    let url = sh_quote(&runtime_url(arch));

    format!(
        "set -e\n\
mkdir -p {base} {bin_dir}\n\
if [ ! -f {archive} ]; then curl -fsSL {url} -o {archive}; fi\n\
if [ ! -d {root} ]; then mkdir -p {root} && tar -xzf {archive} -C {root} --strip-components=1; fi\n\
cat > {wrapper} <<'WRAPPER_EOF'\n{WRAPPER_BODY}WRAPPER_EOF\n\
chmod +x {wrapper}\n"
    )
}

pub async fn install_editor(
    transport: &Transport,
    host: &str,
    layout: &RemoteLayout,
    arch: Arch,
) -> Result<(), ControlError> {
    info!(event = "install_editor", host, version = EDITOR_VERSION, arch = arch.tag());
    transport
        .execute(host, &editor_install_script(layout, arch))
        .await?;
    Ok(())
}

pub async fn install_runtime(
    transport: &Transport,
    host: &str,
    layout: &RemoteLayout,
    arch: Arch,
) -> Result<(), ControlError> {
    info!(event = "install_runtime", host, version = RUNTIME_VERSION, arch = arch.tag());
    transport
        .execute(host, &runtime_install_script(layout, arch))
        .await?;
    Ok(())
}

/// Starts the bus daemon with its stdio attached to the returned process.
/// An existing socket means another controller holds the host: deleting the
/// socket is the agreed takeover signal, and the incumbent gets
/// `HANDOFF_WAIT` to notice and exit before the new daemon binds.
pub async fn start_daemon(
    transport: &Transport,
    host: &str,
    layout: &RemoteLayout,
) -> Result<RemoteProcess, ControlError> {
    let socket = sh_quote(&layout.socket_path().to_string_lossy());

    let occupied = transport
        .execute(host, &format!("test -e {socket}"))
        .await
        .is_ok();
    if occupied {
        info!(event = "daemon_handoff_requested", host);
        transport.execute(host, &format!("rm -f {socket}")).await?;
        tokio::time::sleep(HANDOFF_WAIT).await;
    }

    let daemon = sh_quote(&layout.daemon_binary().to_string_lossy());
    let command = format!("{daemon} --socket {socket}");
    let process = transport.execute_streaming(host, &command).await?;
    info!(event = "daemon_started", host);
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uname_output_maps_to_archive_tags() {
        assert_eq!(Arch::from_uname("x86_64"), Arch::X64);
        assert_eq!(Arch::from_uname("aarch64\n"), Arch::Arm64);
        assert_eq!(Arch::from_uname("arm64"), Arch::Arm64);
        assert_eq!(Arch::from_uname("riscv64"), Arch::X64);
        assert_eq!(Arch::X64.tag(), "linux-x64");
        assert_eq!(Arch::Arm64.tag(), "linux-arm64");
    }

    #[test]
    fn editor_script_gates_download_and_unpack_on_existence() {
        let layout = RemoteLayout::default_base();
        let script = editor_install_script(&layout, Arch::X64);

        assert!(script.contains("if [ ! -f '.theoldswitcheroo/openvscode-server.tar.gz' ]"));
        assert!(script.contains("if [ ! -d '.theoldswitcheroo/openvscode-server' ]"));
        assert!(script.contains("--strip-components=1"));
        assert!(script.contains(&format!("openvscode-server-v{EDITOR_VERSION}-linux-x64.tar.gz")));
        assert!(script.contains("chmod +x '.theoldswitcheroo/openvscode-server/bin/openvscode-server'"));
    }

    #[test]
    fn arm_hosts_get_the_arm_archive() {
        let layout = RemoteLayout::default_base();
        let script = editor_install_script(&layout, Arch::Arm64);
        assert!(script.contains("linux-arm64.tar.gz"));
    }

    #[test]
    fn runtime_script_writes_wrapper_with_bus_environment() {
        let layout = RemoteLayout::default_base();
        let script = runtime_install_script(&layout, Arch::X64);

        assert!(script.contains("cat > '.theoldswitcheroo/bin/taskspace'"));
        assert!(script.contains("export THEOLDSWITCHEROO_SOCKET"));
        assert!(script.contains("export BASE_DIR"));
        assert!(script.contains("exec \"$BASE_DIR/switcheroo/bin/tos-cli\""));
        assert!(script.contains("chmod +x '.theoldswitcheroo/bin/taskspace'"));
        assert!(script.contains("if [ ! -f '.theoldswitcheroo/switcheroo-runtime.tar.gz' ]"));
        assert!(script.contains("if [ ! -d '.theoldswitcheroo/switcheroo' ]"));
    }
}
