//! Host-addressed remote operations over a single authenticated channel.
//!
//! The first operation against a host spawns an OpenSSH control master
//! bound to a per-host control socket; every later shell, copy, and tunnel
//! subordinate rides that master via `ControlPath`. Closing the master ends
//! every subordinate, so controller exit needs no per-subordinate PID
//! bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Wait after spawning a control master before the channel counts as usable.
const SETUP_GRACE: Duration = Duration::from_secs(1);
/// Keep-alive probe cadence on the master; three misses drop the channel.
const KEEPALIVE_INTERVAL_SECS: u32 = 60;
const KEEPALIVE_MAX_MISSES: u32 = 3;
const MASTER_EXIT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("control channel setup failed for {host}: {detail}")]
    Setup { host: String, detail: String },
    #[error("remote command on {host} exited {code}: `{command}`: {stderr}")]
    RemoteCommand {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("upload {local} -> {host}:{remote} exited {code}: {stderr}")]
    Upload {
        host: String,
        local: String,
        remote: String,
        code: i32,
        stderr: String,
    },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live streaming subordinate: piped stdin/stdout/stderr, caller framing.
#[derive(Debug)]
pub struct RemoteProcess {
    child: Child,
}

impl RemoteProcess {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// A local TCP forward to a remote port. Dropping the handle terminates the
/// forward.
#[derive(Debug)]
pub struct PortForward {
    child: Child,
    local: u16,
    remote: u16,
}

impl PortForward {
    pub fn local_port(&self) -> u16 {
        self.local
    }

    pub fn remote_port(&self) -> u16 {
        self.remote
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

struct Channel {
    master: Child,
    control_path: PathBuf,
}

/// One control master per host, created on first use, torn down by
/// `shutdown_all`.
pub struct Transport {
    control_dir: PathBuf,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Transport {
    pub fn new() -> std::io::Result<Self> {
        let control_dir = std::env::temp_dir().join("theoldswitcheroo");
        std::fs::create_dir_all(&control_dir)?;
        Ok(Self {
            control_dir,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn control_path(&self, host: &str) -> PathBuf {
        self.control_dir.join(format!("cm-{}.sock", sanitize_host(host)))
    }

    /// Idempotent: the first call for a host spawns the control master and
    /// waits out the setup grace; later calls return immediately while the
    /// master lives. A dead master is replaced.
    pub async fn ensure_channel(&self, host: &str) -> Result<(), TransportError> {
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get_mut(host) {
            match channel.master.try_wait()? {
                None => return Ok(()),
                Some(status) => {
                    warn!(event = "control_master_died", host, status = %status);
                    let _ = std::fs::remove_file(&channel.control_path);
                    channels.remove(host);
                }
            }
        }

        let control_path = self.control_path(host);
        // A leftover socket from a crashed run would make the new master
        // refuse to bind.
        let _ = std::fs::remove_file(&control_path);

        let mut master = Command::new("ssh")
            .args(master_args(host, &control_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        tokio::time::sleep(SETUP_GRACE).await;

        if let Some(status) = master.try_wait()? {
            let detail = read_stderr(&mut master).await;
            return Err(TransportError::Setup {
                host: host.to_string(),
                detail: if detail.is_empty() {
                    format!("control master exited {status} during setup")
                } else {
                    detail
                },
            });
        }

        info!(event = "control_channel_up", host, control_path = %control_path.display());
        channels.insert(
            host.to_string(),
            Channel {
                master,
                control_path,
            },
        );
        Ok(())
    }

    /// Runs a command to completion, capturing stdout. Non-zero exit
    /// surfaces the command text, exit code, and captured stderr.
    pub async fn execute(&self, host: &str, command: &str) -> Result<String, TransportError> {
        self.ensure_channel(host).await?;
        let control_path = self.control_path(host);

        debug!(event = "remote_exec", host, command);
        let output = Command::new("ssh")
            .args(subordinate_args(&control_path))
            .arg(host)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::RemoteCommand {
                host: host.to_string(),
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string())
    }

    /// Spawns a long-lived subordinate with piped stdio. The child is
    /// killed when the returned handle drops.
    pub async fn execute_streaming(
        &self,
        host: &str,
        command: &str,
    ) -> Result<RemoteProcess, TransportError> {
        self.ensure_channel(host).await?;
        let control_path = self.control_path(host);

        debug!(event = "remote_exec_streaming", host, command);
        let child = Command::new("ssh")
            .args(subordinate_args(&control_path))
            .arg(host)
            .arg("--")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Ok(RemoteProcess { child })
    }

    pub async fn upload(
        &self,
        host: &str,
        local: &Path,
        remote: &Path,
    ) -> Result<(), TransportError> {
        self.ensure_channel(host).await?;
        let control_path = self.control_path(host);

        debug!(event = "upload", host, local = %local.display(), remote = %remote.display());
        let output = Command::new("scp")
            .args(subordinate_args(&control_path))
            .arg("-q")
            .arg(local)
            .arg(format!("{host}:{}", remote.display()))
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::Upload {
                host: host.to_string(),
                local: local.display().to_string(),
                remote: remote.display().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Opens `localhost:local -> remote host:remote`. Requires a prior
    /// `ensure_channel` for the host.
    pub async fn forward_port(
        &self,
        host: &str,
        local: u16,
        remote: u16,
    ) -> Result<PortForward, TransportError> {
        {
            let mut channels = self.channels.lock().await;
            let alive = match channels.get_mut(host) {
                Some(channel) => channel.master.try_wait()?.is_none(),
                None => false,
            };
            if !alive {
                return Err(TransportError::Precondition(format!(
                    "no control channel for {host}; call ensure_channel first"
                )));
            }
        }
        let control_path = self.control_path(host);

        let child = Command::new("ssh")
            .args(subordinate_args(&control_path))
            .arg("-N")
            .arg("-L")
            .arg(format!("127.0.0.1:{local}:127.0.0.1:{remote}"))
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(event = "port_forward_up", host, local, remote);
        Ok(PortForward {
            child,
            local,
            remote,
        })
    }

    /// Terminates every control master. Subordinates ride the masters, so
    /// they end with them; the masters themselves are closed last.
    pub async fn shutdown_all(&self) {
        let mut channels = self.channels.lock().await;
        for (host, mut channel) in channels.drain() {
            let mut exit = Command::new("ssh");
            exit.args(subordinate_args(&channel.control_path))
                .arg("-O")
                .arg("exit")
                .arg(&host)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            let _ = tokio::time::timeout(MASTER_EXIT_WAIT, exit.status()).await;

            let _ = channel.master.start_kill();
            let _ = tokio::time::timeout(MASTER_EXIT_WAIT, channel.master.wait()).await;
            let _ = std::fs::remove_file(&channel.control_path);
            info!(event = "control_channel_down", host = %host);
        }
    }
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn master_args(host: &str, control_path: &Path) -> Vec<String> {
    vec![
        "-N".to_string(),
        "-o".to_string(),
        "ControlMaster=yes".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        format!("ServerAliveInterval={KEEPALIVE_INTERVAL_SECS}"),
        "-o".to_string(),
        format!("ServerAliveCountMax={KEEPALIVE_MAX_MISSES}"),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        host.to_string(),
    ]
}

fn subordinate_args(control_path: &Path) -> Vec<String> {
    vec![
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

async fn read_stderr(child: &mut Child) -> String {
    let mut detail = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut detail).await;
    }
    detail.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_args_carry_keepalive_and_control_path() {
        let args = master_args("user@devbox", Path::new("/tmp/cm.sock"));
        assert_eq!(args.first().map(String::as_str), Some("-N"));
        assert!(args.contains(&"ControlMaster=yes".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/cm.sock".to_string()));
        assert!(args.contains(&"ServerAliveInterval=60".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=3".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("user@devbox"));
    }

    #[test]
    fn subordinate_args_reuse_the_control_path() {
        let args = subordinate_args(Path::new("/tmp/cm.sock"));
        assert_eq!(
            args,
            vec![
                "-o".to_string(),
                "ControlPath=/tmp/cm.sock".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
            ]
        );
    }

    #[test]
    fn host_names_sanitize_into_socket_names() {
        assert_eq!(sanitize_host("user@devbox.example.com"), "user_devbox.example.com");
        assert_eq!(sanitize_host("10.0.0.7"), "10.0.0.7");
    }

    #[test]
    fn remote_command_error_carries_command_and_stderr() {
        let err = TransportError::RemoteCommand {
            host: "devbox".to_string(),
            command: "ls /missing".to_string(),
            code: 2,
            stderr: "ls: cannot access '/missing'".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("ls /missing"));
        assert!(text.contains("exited 2"));
        assert!(text.contains("cannot access"));
    }

    #[tokio::test]
    async fn forward_requires_established_channel() {
        let transport = Transport::new().expect("transport");
        let err = transport
            .forward_port("never-connected", 4000, 4000)
            .await
            .expect_err("must fail");
        assert!(matches!(err, TransportError::Precondition(_)));
    }
}
