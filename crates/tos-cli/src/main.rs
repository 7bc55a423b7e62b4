mod bus;
mod tools;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tos_core::{taskspace_id_from_path, BusEvent, EventRecord, ProgressCategory};

#[derive(Parser)]
#[command(name = "taskspace")]
#[command(about = "Talk to the taskspace controller from inside a taskspace", long_about = None)]
struct Cli {
    /// Bus socket path; falls back to $THEOLDSWITCHEROO_SOCKET, then
    /// <base>/daemon.sock.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Ask the controller to provision a new taskspace
    NewTaskspace(NewTaskspaceArgs),
    /// Rename or re-describe the taskspace this directory belongs to
    UpdateTaskspace(UpdateTaskspaceArgs),
    /// Request a roster summary from the controller
    Status,
    /// Record a progress line, attributed to this taskspace when possible
    LogProgress(LogProgressArgs),
    /// Ask for the user's attention
    SignalUser(SignalUserArgs),
    /// Serve the tool-protocol front-end on stdio
    Tools,
}

#[derive(Args)]
struct NewTaskspaceArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    cwd: Option<String>,
    #[arg(long)]
    initial_prompt: Option<String>,
}

#[derive(Args)]
struct UpdateTaskspaceArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Args)]
struct LogProgressArgs {
    #[arg(long)]
    message: String,
    #[arg(long)]
    category: ProgressCategory,
}

#[derive(Args)]
struct SignalUserArgs {
    #[arg(long)]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = bus::resolve_socket_path(cli.socket);

    let event = match cli.command {
        Commands::NewTaskspace(args) => BusEvent::NewTaskspaceRequest {
            name: args.name,
            description: args.description,
            cwd: args.cwd.or_else(|| {
                std::env::current_dir()
                    .ok()
                    .map(|d| d.to_string_lossy().into_owned())
            }),
            initial_prompt: args.initial_prompt,
        },
        Commands::UpdateTaskspace(args) => {
            let cwd = std::env::current_dir().context("resolve working directory")?;
            let Some(uuid) = taskspace_id_from_path(&cwd) else {
                bail!(
                    "working directory {} is not inside a taskspace clone",
                    cwd.display()
                );
            };
            BusEvent::UpdateTaskspace {
                uuid,
                name: args.name,
                description: args.description,
            }
        }
        Commands::Status => BusEvent::StatusRequest,
        Commands::LogProgress(args) => BusEvent::ProgressLog {
            message: args.message,
            category: args.category,
            taskspace_uuid: std::env::current_dir()
                .ok()
                .and_then(|d| taskspace_id_from_path(&d)),
        },
        Commands::SignalUser(args) => BusEvent::UserSignal {
            message: args.message,
            taskspace_uuid: std::env::current_dir()
                .ok()
                .and_then(|d| taskspace_id_from_path(&d)),
        },
        Commands::Tools => {
            return tools::serve(socket_path).await;
        }
    };

    bus::send(&socket_path, &EventRecord::new(event)).await
}
