use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 64;
const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub socket_path: PathBuf,
    /// Cadence of the own-socket liveness check. The handoff contract asks
    /// for exit within about two seconds of deletion.
    pub watch_interval: Duration,
}

impl RelayConfig {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            watch_interval: Duration::from_millis(500),
        }
    }
}

enum ClientEvent {
    Line(u64, String),
    Gone(u64),
}

/// Binds the relay socket. The socket file's presence is the liveness
/// signal for other controllers, so an existing file means another
/// instance holds the host and this one must refuse to start.
pub fn bind(config: &RelayConfig) -> io::Result<UnixListener> {
    if config.socket_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!(
                "socket {} exists; another daemon appears to be running",
                config.socket_path.display()
            ),
        ));
    }

    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));
    Ok(listener)
}

/// Copies whole lines both ways until the controller goes away, the socket
/// file is deleted (handoff), or shutdown is signalled. Bodies are never
/// parsed; routing is the controller's job.
pub async fn run(
    listener: UnixListener,
    config: RelayConfig,
    stdin: impl AsyncRead + Unpin,
    mut stdout: impl AsyncWrite + Unpin,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel::<ClientEvent>(EVENT_QUEUE_CAPACITY);
    let mut clients: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut next_client_id: u64 = 0;

    let mut stdin_lines = BufReader::new(stdin).lines();
    let mut watch_tick = tokio::time::interval(config.watch_interval);
    watch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(event = "relay_start", socket = %config.socket_path.display());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    info!(event = "relay_shutdown_signal");
                    let _ = fs::remove_file(&config.socket_path);
                    break;
                }
            }
            _ = watch_tick.tick() => {
                if !config.socket_path.exists() {
                    // Deletion is the agreed takeover signal from a new
                    // controller; release the host promptly.
                    info!(event = "relay_handoff", socket = %config.socket_path.display());
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let id = next_client_id;
                        next_client_id += 1;
                        let sender = spawn_client(id, stream, events_tx.clone());
                        clients.insert(id, sender);
                        debug!(event = "client_connected", id);
                    }
                    Err(err) => {
                        warn!(event = "accept_error", error = %err);
                    }
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(ClientEvent::Line(id, line)) => {
                        debug!(event = "client_line", id, bytes = line.len());
                        if let Err(err) = write_line(&mut stdout, &line).await {
                            // Controller-side pipe is gone; nothing left to
                            // relay for.
                            warn!(event = "stdout_closed", error = %err);
                            let _ = fs::remove_file(&config.socket_path);
                            break;
                        }
                    }
                    Some(ClientEvent::Gone(id)) => {
                        clients.remove(&id);
                        debug!(event = "client_disconnected", id);
                    }
                    None => break,
                }
            }
            line = stdin_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        clients.retain(|id, sender| {
                            match sender.try_send(line.clone()) {
                                Ok(()) => true,
                                Err(err) => {
                                    warn!(event = "client_dropped", id, error = %err);
                                    false
                                }
                            }
                        });
                    }
                    Ok(None) | Err(_) => {
                        info!(event = "relay_stdin_closed");
                        let _ = fs::remove_file(&config.socket_path);
                        break;
                    }
                }
            }
        }
    }

    drop(clients);
    info!(event = "relay_stop");
    Ok(())
}

/// Starts the reader and writer halves of one client connection. Reader
/// lines are funneled to the central loop; broadcast lines arrive on the
/// returned sender. I/O errors drop only this client.
fn spawn_client(
    id: u64,
    stream: UnixStream,
    events: mpsc::Sender<ClientEvent>,
) -> mpsc::Sender<String> {
    let (read_half, write_half) = stream.into_split();
    let (broadcast_tx, broadcast_rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);

    tokio::spawn(client_writer(id, write_half, broadcast_rx, events.clone()));

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events.send(ClientEvent::Line(id, line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "client_read_error", id, error = %err);
                    break;
                }
            }
        }
        let _ = events.send(ClientEvent::Gone(id)).await;
    });

    broadcast_tx
}

async fn client_writer(
    id: u64,
    mut write_half: OwnedWriteHalf,
    mut broadcast_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(line) = broadcast_rx.recv().await {
        if let Err(err) = write_line(&mut write_half, &line).await {
            warn!(event = "client_write_error", id, error = %err);
            let _ = events.send(ClientEvent::Gone(id)).await;
            return;
        }
    }
}

async fn write_line(writer: &mut (impl AsyncWrite + Unpin), line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        config: RelayConfig,
        stdin_tx: DuplexStream,
        stdout_rx: DuplexStream,
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<io::Result<()>>,
    }

    fn test_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tosd-{tag}-{}-{}.sock",
            std::process::id(),
            chrono_free_nonce()
        ))
    }

    // Monotonic per-process nonce; keeps socket paths short and unique.
    fn chrono_free_nonce() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NONCE: AtomicU64 = AtomicU64::new(0);
        NONCE.fetch_add(1, Ordering::Relaxed)
    }

    async fn launch(tag: &str) -> Harness {
        let mut config = RelayConfig::new(test_socket(tag));
        config.watch_interval = Duration::from_millis(100);

        let listener = bind(&config).expect("bind");
        let (stdin_tx, stdin_rx) = tokio::io::duplex(4096);
        let (stdout_tx, stdout_rx) = tokio::io::duplex(4096);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(
            listener,
            config.clone(),
            stdin_rx,
            stdout_tx,
            shutdown_rx,
        ));

        Harness {
            config,
            stdin_tx,
            stdout_rx,
            shutdown_tx,
            handle,
        }
    }

    async fn read_one_line(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader.read(&mut byte).await.expect("read");
            assert!(n > 0, "stream closed before newline");
            if byte[0] == b'\n' {
                break;
            }
            collected.push(byte[0]);
        }
        String::from_utf8(collected).expect("utf8 line")
    }

    #[tokio::test]
    async fn refuses_to_start_when_socket_exists() {
        let config = RelayConfig::new(test_socket("busy"));
        std::fs::create_dir_all(config.socket_path.parent().unwrap()).expect("mkdir");
        std::fs::write(&config.socket_path, b"").expect("occupy path");

        let err = bind(&config).expect_err("bind must refuse");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        let _ = std::fs::remove_file(&config.socket_path);
    }

    #[tokio::test]
    async fn socket_is_owner_only() {
        let harness = launch("perms").await;
        let mode = std::fs::metadata(&harness.config.socket_path)
            .expect("socket metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = harness.shutdown_tx.send(true);
        harness.handle.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn client_lines_reach_stdout_verbatim() {
        let mut harness = launch("c2s").await;

        let mut client = UnixStream::connect(&harness.config.socket_path)
            .await
            .expect("connect");
        let payload = r#"{"type":"status_request","timestamp":"2025-03-01T10:00:00Z"}"#;
        client
            .write_all(format!("{payload}\n").as_bytes())
            .await
            .expect("client write");

        let line = read_one_line(&mut harness.stdout_rx).await;
        assert_eq!(line, payload);
        // Relay never re-encodes; the line must still parse as-is.
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["type"], "status_request");

        let _ = harness.shutdown_tx.send(true);
        harness.handle.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn stdin_lines_broadcast_to_every_client() {
        let mut harness = launch("s2c").await;

        let mut first = UnixStream::connect(&harness.config.socket_path)
            .await
            .expect("connect first");
        let mut second = UnixStream::connect(&harness.config.socket_path)
            .await
            .expect("connect second");
        // Give the accept loop a beat to register both.
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness
            .stdin_tx
            .write_all(b"{\"type\":\"status_response\",\"taskspaces\":[]}\n")
            .await
            .expect("stdin write");

        for client in [&mut first, &mut second] {
            let line = read_one_line(client).await;
            assert!(line.contains("status_response"));
        }

        let _ = harness.shutdown_tx.send(true);
        harness.handle.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn one_client_dropping_does_not_stop_the_relay() {
        let mut harness = launch("drop").await;

        let dying = UnixStream::connect(&harness.config.socket_path)
            .await
            .expect("connect dying");
        let mut survivor = UnixStream::connect(&harness.config.socket_path)
            .await
            .expect("connect survivor");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(dying);
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness
            .stdin_tx
            .write_all(b"still-here\n")
            .await
            .expect("stdin write");
        let line = read_one_line(&mut survivor).await;
        assert_eq!(line, "still-here");

        let _ = harness.shutdown_tx.send(true);
        harness.handle.await.expect("join").expect("run ok");
    }

    #[tokio::test]
    async fn socket_deletion_triggers_exit_within_bound() {
        let harness = launch("handoff").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::remove_file(&harness.config.socket_path).expect("delete socket");

        let result = tokio::time::timeout(Duration::from_secs(2), harness.handle)
            .await
            .expect("exit within handoff bound")
            .expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stdin_close_stops_relay_and_removes_socket() {
        let harness = launch("stdin-eof").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(harness.stdin_tx);

        let result = tokio::time::timeout(Duration::from_secs(2), harness.handle)
            .await
            .expect("exit after stdin close")
            .expect("join");
        assert!(result.is_ok());
        assert!(!harness.config.socket_path.exists());
    }

    #[tokio::test]
    async fn shutdown_removes_socket_file() {
        let harness = launch("cleanup").await;
        assert!(harness.config.socket_path.exists());

        let _ = harness.shutdown_tx.send(true);
        harness.handle.await.expect("join").expect("run ok");
        assert!(!harness.config.socket_path.exists());
    }
}
