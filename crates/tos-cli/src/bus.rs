use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tos_core::EventRecord;

/// How long to wait for the daemon to close its side after our half-close.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

pub fn resolve_socket_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = std::env::var_os(tos_core::SOCKET_ENV) {
        return PathBuf::from(path);
    }
    let base = std::env::var_os(tos_core::BASE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(tos_core::DEFAULT_BASE_DIR)
        });
    base.join(tos_core::SOCKET_FILE)
}

/// Fire-and-forget delivery: write the single-line record, half-close, wait
/// for the daemon to hang up. Replies travel to the controller, never back
/// through this connection.
pub async fn send(socket_path: &Path, record: &EventRecord) -> Result<()> {
    if !socket_path.exists() {
        bail!(
            "taskspace daemon unavailable: no socket at {}",
            socket_path.display()
        );
    }

    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect to {}", socket_path.display()))?;

    let line = record.to_line().context("encode event")?;
    stream.write_all(line.as_bytes()).await.context("write event")?;
    stream.write_all(b"\n").await.context("write event")?;
    stream.shutdown().await.context("half-close")?;

    let drain = async {
        let mut sink = [0u8; 256];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };
    if timeout(CLOSE_WAIT, drain).await.is_err() {
        bail!("daemon did not close the connection within {CLOSE_WAIT:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tos_core::BusEvent;

    fn test_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tos-cli-{tag}-{}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn missing_socket_is_an_error_without_touching_the_bus() {
        let path = test_socket("missing");
        let _ = std::fs::remove_file(&path);

        let record = EventRecord::new(BusEvent::StatusRequest);
        let err = send(&path, &record).await.expect_err("must fail");
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn delivers_one_line_and_returns_after_peer_close() {
        use tokio::io::AsyncBufReadExt;
        use tokio::net::UnixListener;

        let path = test_socket("deliver");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut lines = tokio::io::BufReader::new(stream).lines();
            lines.next_line().await.expect("read line").expect("one line")
        });

        let record = EventRecord::new(BusEvent::UserSignal {
            message: "need a decision".to_string(),
            taskspace_uuid: None,
        });
        send(&path, &record).await.expect("send");

        let received = server.await.expect("join");
        assert_eq!(EventRecord::from_line(&received).expect("parse"), record);
        let _ = std::fs::remove_file(&path);
    }
}
