use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tos_controller::{router, CreateRequest, HeadlessSurface, Orchestrator, ProjectSpec};
use tos_core::{ExtensionManifest, RemoteLayout};
use tos_storage::{Settings, Store};
use tos_transport::Transport;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tos-controller")]
#[command(about = "Supervise taskspaces on a remote host", long_about = None)]
struct Args {
    /// Remote host (user@host); defaults to the persisted settings.
    #[arg(long)]
    host: Option<String>,
    /// Remote base directory; falls back to $BASE_DIR, then
    /// ~/.theoldswitcheroo on the remote side.
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Local data directory override (roster and settings).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Project clone script uploaded as fresh-clone.sh for new taskspaces.
    #[arg(long)]
    clone_script: Option<PathBuf>,
    /// Marketplace extension identifier to install per taskspace
    /// (repeatable).
    #[arg(long = "extension")]
    extensions: Vec<String>,
    /// Local .vsix package to upload and install per taskspace
    /// (repeatable).
    #[arg(long = "vsix")]
    vsix: Vec<PathBuf>,
    /// Name for the first taskspace when the roster is empty.
    #[arg(long, default_value = "main")]
    name: String,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn project_spec(args: &Args) -> ProjectSpec {
    ProjectSpec {
        clone_script: args.clone_script.clone(),
        extensions: ExtensionManifest {
            marketplace: args.extensions.clone(),
            vsix: args
                .vsix
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect(),
        },
        vsix_files: args.vsix.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let store = match &args.data_dir {
        Some(dir) => Store::open_at(dir.clone()),
        None => Store::open_default(),
    };

    let host = match args.host.clone().or_else(|| {
        store.load_settings().map(|settings| settings.hostname)
    }) {
        Some(host) if !host.is_empty() => host,
        _ => bail!("no host configured; pass --host or set it in settings.json"),
    };
    if let Err(err) = store.save_settings(&Settings {
        hostname: host.clone(),
    }) {
        warn!(event = "settings_persist_failed", error = %err);
    }

    let layout = args
        .base_dir
        .clone()
        .or_else(|| std::env::var_os(tos_core::BASE_DIR_ENV).map(PathBuf::from))
        .map(RemoteLayout::new)
        .unwrap_or_else(RemoteLayout::default_base);

    let transport = Arc::new(Transport::new().context("create transport")?);
    let surface = Arc::new(HeadlessSurface::new());
    let orchestrator = Arc::new(Orchestrator::new(
        host.clone(),
        layout,
        transport,
        surface,
        store,
        project_spec(&args),
    ));

    let mut daemon = orchestrator.bootstrap().await.context("prepare host")?;
    let daemon_stdout = daemon
        .take_stdout()
        .context("daemon stdout unavailable")?;
    let daemon_stdin = daemon.take_stdin().context("daemon stdin unavailable")?;
    if let Some(stderr) = daemon.take_stderr() {
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(event = "daemon_stderr", line = %line);
            }
        });
    }

    orchestrator.restore().await.context("restore roster")?;

    if orchestrator.roster_is_empty().await {
        let id = orchestrator
            .create_taskspace(CreateRequest {
                name: args.name.clone(),
                description: None,
                initial_prompt: None,
            })
            .await
            .context("create initial taskspace")?;
        if let Err(err) = orchestrator.focus_taskspace(id).await {
            warn!(event = "initial_start_failed", uuid = %id, error = %err);
        }
    } else if let Some(active) = orchestrator.active_taskspace().await {
        if let Err(err) = orchestrator.focus_taskspace(active).await {
            warn!(event = "restore_start_failed", uuid = %active, error = %err);
        }
    }

    let terminated = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = router::run(orchestrator.clone(), daemon_stdout, daemon_stdin) => {
            match result {
                Ok(()) => warn!(event = "daemon_stream_ended"),
                Err(err) => warn!(event = "router_failed", error = %err),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = "interrupt");
        }
        _ = terminated => {
            info!(event = "terminated");
        }
    }

    let _ = daemon.start_kill();
    orchestrator.shutdown().await;
    Ok(())
}
