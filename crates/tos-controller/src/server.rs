//! Editor-server launch scripts, port discovery, and the health probe.

use crate::ControlError;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tos_core::{scrape_port, RemoteLayout, Taskspace};
use tracing::{debug, warn};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const PROBE_MAX_ATTEMPTS: u32 = 10;
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_BACKOFF_START: Duration = Duration::from_secs(1);
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Single-quote a string for /bin/sh.
pub(crate) fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// One script per start: create the per-taskspace editor directories,
/// install manifest extensions (each its own editor invocation against the
/// taskspace-local extensions root), then exec the server itself. Any
/// `.vsix` files are uploaded into the taskspace root before this runs.
pub fn build_launch_script(layout: &RemoteLayout, taskspace: &Taskspace) -> String {
    let editor = sh_quote(&layout.editor_binary().to_string_lossy());
    let server_data = sh_quote(&layout.server_data_dir(taskspace.id).to_string_lossy());
    let extensions = sh_quote(&layout.extensions_dir(taskspace.id).to_string_lossy());
    let user_data = sh_quote(&layout.user_data_dir().to_string_lossy());
    let clone_dir = sh_quote(&layout.clone_dir(taskspace.id).to_string_lossy());

    let mut script = String::new();
    script.push_str("set -e\n");
    let _ = writeln!(script, "mkdir -p {server_data} {extensions} {user_data}");

    for extension in &taskspace.extensions.marketplace {
        let _ = writeln!(
            script,
            "{editor} --extensions-dir {extensions} --install-extension {}",
            sh_quote(extension)
        );
    }
    for vsix in &taskspace.extensions.vsix {
        let package = layout.taskspace_root(taskspace.id).join(vsix);
        let _ = writeln!(
            script,
            "{editor} --extensions-dir {extensions} --install-extension {}",
            sh_quote(&package.to_string_lossy())
        );
    }

    let _ = writeln!(
        script,
        "exec {editor} --host 0.0.0.0 --port 0 \
--server-data-dir {server_data} \
--extensions-dir {extensions} \
--user-data-dir {user_data} \
--without-connection-token \
--enable-remote-auto-shutdown \
--disable-workspace-trust \
--default-folder {clone_dir}"
    );
    script
}

/// Scans stdout lines for the port announcement. The caller keeps the line
/// stream afterwards so the rest of the server's output can still be
/// drained.
pub async fn discover_port<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    startup_timeout: Duration,
) -> Result<u16, ControlError> {
    let scan = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(event = "server_stdout", line = %line);
                    if let Some(port) = scrape_port(&line) {
                        return Ok(port);
                    }
                }
                Ok(None) => {
                    return Err(ControlError::StartupFailed {
                        detail: "server stdout closed before announcing a port".to_string(),
                    })
                }
                Err(err) => {
                    return Err(ControlError::StartupFailed {
                        detail: err.to_string(),
                    })
                }
            }
        }
    };

    match tokio::time::timeout(startup_timeout, scan).await {
        Ok(result) => result,
        Err(_) => Err(ControlError::StartupTimeout {
            timeout_secs: startup_timeout.as_secs(),
        }),
    }
}

/// `GET /` against the forwarded local port. Non-200 counts as failure.
/// Backoff doubles from one second up to a five-second cap.
pub async fn probe_editor(
    client: &reqwest::Client,
    port: u16,
    max_attempts: u32,
) -> Result<(), ControlError> {
    let url = format!("http://localhost:{port}/");
    let mut backoff = PROBE_BACKOFF_START;

    for attempt in 1..=max_attempts {
        match client
            .get(&url)
            .timeout(PROBE_ATTEMPT_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status() == reqwest::StatusCode::OK => return Ok(()),
            Ok(response) => {
                warn!(event = "probe_bad_status", port, attempt, status = %response.status());
            }
            Err(err) => {
                debug!(event = "probe_error", port, attempt, error = %err);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(PROBE_BACKOFF_CAP);
        }
    }

    Err(ControlError::ProbeFailed {
        port,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tos_core::ExtensionManifest;

    fn sample_taskspace() -> Taskspace {
        let mut taskspace = Taskspace::new("alpha");
        taskspace.extensions = ExtensionManifest {
            marketplace: vec![
                "rust-lang.rust-analyzer".to_string(),
                "vadimcn.vscode-lldb".to_string(),
            ],
            vsix: vec!["in-house-tools.vsix".to_string()],
        };
        taskspace
    }

    #[test]
    fn quote_survives_embedded_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn launch_script_carries_required_server_flags() {
        let layout = RemoteLayout::default_base();
        let taskspace = sample_taskspace();
        let script = build_launch_script(&layout, &taskspace);

        assert!(script.starts_with("set -e\n"));
        for flag in [
            "--host 0.0.0.0",
            "--port 0",
            "--without-connection-token",
            "--enable-remote-auto-shutdown",
            "--disable-workspace-trust",
        ] {
            assert!(script.contains(flag), "missing {flag} in:\n{script}");
        }
        assert!(script.contains(&format!("taskspace-{}/server-data", taskspace.id)));
        assert!(script.contains(&format!("taskspace-{}/extensions", taskspace.id)));
        assert!(script.contains("vscode-user-data"));
        assert!(script.contains(&format!("--default-folder '.theoldswitcheroo/taskspaces/{}/clone'", taskspace.id)));
    }

    #[test]
    fn launch_script_installs_extensions_before_exec() {
        let layout = RemoteLayout::default_base();
        let taskspace = sample_taskspace();
        let script = build_launch_script(&layout, &taskspace);

        let analyzer = script.find("rust-lang.rust-analyzer").expect("marketplace id");
        let lldb = script.find("vadimcn.vscode-lldb").expect("second id");
        let vsix = script.find("in-house-tools.vsix").expect("vsix package");
        let exec = script.find("exec ").expect("exec line");
        assert!(analyzer < lldb && lldb < vsix && vsix < exec);
        assert_eq!(script.matches("--install-extension").count(), 3);
    }

    #[tokio::test]
    async fn port_discovery_reads_until_announcement() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"Extension host starting\nWeb UI available at http://0.0.0.0:45137\nmore output\n")
            .await
            .expect("feed stdout");

        let port = discover_port(&mut lines, Duration::from_secs(5))
            .await
            .expect("port");
        assert_eq!(port, 45137);

        // The stream remains usable for draining the rest of the output.
        let rest = lines.next_line().await.expect("read").expect("line");
        assert_eq!(rest, "more output");
    }

    #[tokio::test]
    async fn port_discovery_times_out_without_announcement() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut lines = BufReader::new(reader).lines();
        writer
            .write_all(b"starting up\nstill starting\n")
            .await
            .expect("feed stdout");

        let err = discover_port(&mut lines, Duration::from_millis(200))
            .await
            .expect_err("must time out");
        assert!(matches!(err, ControlError::StartupTimeout { .. }));
    }

    #[tokio::test]
    async fn closed_stdout_is_a_startup_failure() {
        let (writer, reader) = tokio::io::duplex(1024);
        drop(writer);
        let mut lines = BufReader::new(reader).lines();

        let err = discover_port(&mut lines, Duration::from_secs(1))
            .await
            .expect_err("must fail");
        assert!(matches!(err, ControlError::StartupFailed { .. }));
    }

    #[tokio::test]
    async fn probe_succeeds_against_a_live_server() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await;
            }
        });

        let client = reqwest::Client::new();
        probe_editor(&client, port, 3).await.expect("probe ok");
    }

    #[tokio::test]
    async fn probe_gives_up_after_max_attempts() {
        use tokio::net::TcpListener;

        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = reqwest::Client::new();
        let err = probe_editor(&client, port, 1).await.expect_err("must fail");
        assert!(matches!(
            err,
            ControlError::ProbeFailed { attempts: 1, .. }
        ));
    }
}
