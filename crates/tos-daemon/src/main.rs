mod relay;

use clap::Parser;
use relay::RelayConfig;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Remote-side bus daemon: relays single-line JSON events between the
/// controller (attached to this process's stdio) and local clients on the
/// unix socket. stdout carries bus traffic only; all logging goes to
/// stderr.
#[derive(Parser, Debug)]
#[command(name = "tos-daemon")]
struct Args {
    /// Socket path; falls back to $THEOLDSWITCHEROO_SOCKET, then
    /// <base>/daemon.sock.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Base directory; falls back to $BASE_DIR, then ~/.theoldswitcheroo.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

fn resolve_socket_path(args: &Args) -> PathBuf {
    if let Some(socket) = &args.socket {
        return socket.clone();
    }
    if let Some(socket) = std::env::var_os(tos_core::SOCKET_ENV) {
        return PathBuf::from(socket);
    }
    let base = args
        .base_dir
        .clone()
        .or_else(|| std::env::var_os(tos_core::BASE_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(tos_core::DEFAULT_BASE_DIR)
        });
    base.join(tos_core::SOCKET_FILE)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging();

    let config = RelayConfig::new(resolve_socket_path(&args));
    let listener = match relay::bind(&config) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("tos-daemon: {err}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        let _ = shutdown_tx.send(true);
    });

    let result = relay::run(
        listener,
        config,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_rx,
    )
    .await;

    if let Err(err) = result {
        eprintln!("tos-daemon: {err}");
        std::process::exit(1);
    }
}
