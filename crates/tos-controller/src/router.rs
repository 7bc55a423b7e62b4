//! Dispatches typed bus events from the daemon's stdout to lifecycle
//! handlers and injects replies on its stdin.
//!
//! Lines are processed strictly in arrival order on a single stream; a
//! handler must finish before the next line is considered. The daemon is
//! the serialization point, so no per-source queues exist here.

use crate::lifecycle::{CreateRequest, Orchestrator};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tos_core::{BusEvent, EventRecord};
use tracing::{debug, info, warn};

pub async fn run(
    orchestrator: Arc<Orchestrator>,
    daemon_stdout: impl AsyncRead + Unpin,
    mut daemon_stdin: impl AsyncWrite + Unpin,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(daemon_stdout).lines();
    while let Some(line) = lines.next_line().await? {
        dispatch_line(&orchestrator, &line, &mut daemon_stdin).await;
    }
    info!(event = "router_stream_closed");
    Ok(())
}

async fn dispatch_line(
    orchestrator: &Arc<Orchestrator>,
    line: &str,
    daemon_stdin: &mut (impl AsyncWrite + Unpin),
) {
    if line.trim().is_empty() {
        return;
    }

    // Anything that is not a JSON object is daemon log output.
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => {
            info!(event = "daemon_log", line = %line);
            return;
        }
    };

    let Some(type_name) = value.get("type").and_then(|t| t.as_str()).map(str::to_string) else {
        warn!(event = "event_without_type", line = %line);
        return;
    };

    let record: EventRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(err) => {
            warn!(event = "unrecognized_event", event_type = %type_name, error = %err);
            return;
        }
    };

    match record.event {
        BusEvent::NewTaskspaceRequest {
            name,
            description,
            cwd,
            initial_prompt,
        } => {
            debug!(event = "bus_new_taskspace", name = %name, cwd = %cwd.unwrap_or_default());
            let request = CreateRequest {
                name,
                description,
                initial_prompt,
            };
            match orchestrator.create_taskspace(request).await {
                Ok(id) => {
                    if let Err(err) = orchestrator.focus_taskspace(id).await {
                        warn!(event = "bus_taskspace_start_failed", uuid = %id, error = %err);
                    }
                }
                Err(err) => {
                    warn!(event = "bus_taskspace_create_failed", error = %err);
                }
            }
        }
        BusEvent::UpdateTaskspace {
            uuid,
            name,
            description,
        } => {
            if let Err(err) = orchestrator.rename_taskspace(uuid, name, description).await {
                warn!(event = "bus_update_failed", uuid = %uuid, error = %err);
            }
        }
        BusEvent::StatusRequest => {
            let (taskspaces, active_task_space) = orchestrator.status_summary().await;
            let response = EventRecord::new(BusEvent::StatusResponse {
                taskspaces,
                active_task_space,
            });
            if let Err(err) = send_record(daemon_stdin, &response).await {
                warn!(event = "status_response_failed", error = %err);
            }
        }
        BusEvent::ProgressLog {
            message,
            category,
            taskspace_uuid,
        } => {
            orchestrator
                .record_progress(&message, category, taskspace_uuid)
                .await;
        }
        BusEvent::UserSignal {
            message,
            taskspace_uuid,
        } => {
            orchestrator
                .record_user_signal(&message, taskspace_uuid)
                .await;
        }
        // Controller-originated; a client echoing one back is noise.
        BusEvent::StatusResponse { .. } => {
            debug!(event = "ignored_status_response");
        }
    }
}

async fn send_record(
    daemon_stdin: &mut (impl AsyncWrite + Unpin),
    record: &EventRecord,
) -> std::io::Result<()> {
    let line = record
        .to_line()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    daemon_stdin.write_all(line.as_bytes()).await?;
    daemon_stdin.write_all(b"\n").await?;
    daemon_stdin.flush().await
}
