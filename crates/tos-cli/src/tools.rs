use crate::bus;
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tos_core::{taskspace_id_from_path, BusEvent, EventRecord, ProgressCategory, TaskspaceId};

/// Tool-protocol front-end: newline-delimited JSON requests on stdin,
/// newline-delimited replies on stdout. Tools exist only when a taskspace
/// identifier can be derived from the working directory, and every emitted
/// event carries that identifier.
#[derive(Debug, Deserialize)]
struct ToolRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

struct Outcome {
    reply: Value,
    outgoing: Option<EventRecord>,
}

impl Outcome {
    fn reply_only(reply: Value) -> Self {
        Self {
            reply,
            outgoing: None,
        }
    }
}

pub async fn serve(socket_path: PathBuf) -> Result<()> {
    let cwd = std::env::current_dir().unwrap_or_default();
    let taskspace = taskspace_id_from_path(&cwd);
    let cwd = cwd.to_string_lossy().into_owned();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => handle(&request, taskspace, &cwd),
            Err(err) => Outcome::reply_only(error_reply(Value::Null, &format!("bad request: {err}"))),
        };

        let reply = match outcome.outgoing {
            Some(record) => match bus::send(&socket_path, &record).await {
                Ok(()) => outcome.reply,
                Err(err) => error_reply(outcome.reply["id"].clone(), &err.to_string()),
            },
            None => outcome.reply,
        };

        let mut encoded = serde_json::to_string(&reply)?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle(request: &ToolRequest, taskspace: Option<TaskspaceId>, cwd: &str) -> Outcome {
    match request.method.as_str() {
        "tools/list" => Outcome::reply_only(json!({
            "id": request.id,
            "result": { "tools": tool_descriptors(taskspace) },
        })),
        "tools/call" => handle_call(request, taskspace, cwd),
        other => Outcome::reply_only(error_reply(
            request.id.clone(),
            &format!("unknown method: {other}"),
        )),
    }
}

fn handle_call(request: &ToolRequest, taskspace: Option<TaskspaceId>, cwd: &str) -> Outcome {
    let Some(uuid) = taskspace else {
        return Outcome::reply_only(error_reply(
            request.id.clone(),
            "no taskspace tools available outside a taskspace directory",
        ));
    };

    let name = request.params["name"].as_str().unwrap_or_default();
    let arguments = &request.params["arguments"];

    let event = match name {
        "log_progress" => {
            let Some(message) = arguments["message"].as_str() else {
                return Outcome::reply_only(error_reply(request.id.clone(), "message is required"));
            };
            let category = arguments["category"]
                .as_str()
                .unwrap_or("info")
                .parse::<ProgressCategory>();
            let category = match category {
                Ok(category) => category,
                Err(err) => return Outcome::reply_only(error_reply(request.id.clone(), &err)),
            };
            BusEvent::ProgressLog {
                message: message.to_string(),
                category,
                taskspace_uuid: Some(uuid),
            }
        }
        "signal_user" => {
            let Some(message) = arguments["message"].as_str() else {
                return Outcome::reply_only(error_reply(request.id.clone(), "message is required"));
            };
            BusEvent::UserSignal {
                message: message.to_string(),
                taskspace_uuid: Some(uuid),
            }
        }
        "update_taskspace" => BusEvent::UpdateTaskspace {
            uuid,
            name: arguments["name"].as_str().map(str::to_string),
            description: arguments["description"].as_str().map(str::to_string),
        },
        "spawn_taskspace" => {
            let Some(name) = arguments["name"].as_str() else {
                return Outcome::reply_only(error_reply(request.id.clone(), "name is required"));
            };
            BusEvent::NewTaskspaceRequest {
                name: name.to_string(),
                description: arguments["description"].as_str().map(str::to_string),
                cwd: Some(cwd.to_string()),
                initial_prompt: arguments["initial_prompt"].as_str().map(str::to_string),
            }
        }
        other => {
            return Outcome::reply_only(error_reply(
                request.id.clone(),
                &format!("unknown tool: {other}"),
            ));
        }
    };

    Outcome {
        reply: json!({ "id": request.id, "result": { "ok": true } }),
        outgoing: Some(EventRecord::new(event)),
    }
}

fn error_reply(id: Value, message: &str) -> Value {
    json!({ "id": id, "error": { "message": message } })
}

fn tool_descriptors(taskspace: Option<TaskspaceId>) -> Vec<Value> {
    if taskspace.is_none() {
        return Vec::new();
    }
    vec![
        json!({
            "name": "log_progress",
            "description": "Record a progress line against this taskspace",
            "input_schema": {
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "category": { "enum": ["info", "warn", "error", "milestone", "question"] },
                },
                "required": ["message"],
            },
        }),
        json!({
            "name": "signal_user",
            "description": "Ask for the user's attention",
            "input_schema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"],
            },
        }),
        json!({
            "name": "update_taskspace",
            "description": "Rename or re-describe this taskspace",
            "input_schema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                },
            },
        }),
        json!({
            "name": "spawn_taskspace",
            "description": "Ask the controller to provision a new taskspace",
            "input_schema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "initial_prompt": { "type": "string" },
                },
                "required": ["name"],
            },
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, params: Value) -> ToolRequest {
        ToolRequest {
            id: json!(1),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn tool_set_is_empty_outside_a_taskspace() {
        let outcome = handle(&request("tools/list", Value::Null), None, "/home/u/elsewhere");
        assert_eq!(outcome.reply["result"]["tools"], json!([]));
        assert!(outcome.outgoing.is_none());
    }

    #[test]
    fn tool_set_is_populated_inside_a_taskspace() {
        let outcome = handle(
            &request("tools/list", Value::Null),
            Some(TaskspaceId::new()),
            "/cwd",
        );
        let tools = outcome.reply["result"]["tools"].as_array().expect("tools");
        let names: Vec<&str> = tools
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["log_progress", "signal_user", "update_taskspace", "spawn_taskspace"]
        );
    }

    #[test]
    fn calls_attach_the_derived_taskspace_id() {
        let uuid = TaskspaceId::new();
        let outcome = handle(
            &request(
                "tools/call",
                json!({ "name": "log_progress", "arguments": { "message": "built", "category": "milestone" } }),
            ),
            Some(uuid),
            "/cwd",
        );

        let record = outcome.outgoing.expect("event");
        match record.event {
            BusEvent::ProgressLog {
                taskspace_uuid,
                category,
                ref message,
            } => {
                assert_eq!(taskspace_uuid, Some(uuid));
                assert_eq!(category, ProgressCategory::Milestone);
                assert_eq!(message, "built");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(outcome.reply["result"]["ok"], json!(true));
    }

    #[test]
    fn calls_without_a_taskspace_are_rejected() {
        let outcome = handle(
            &request(
                "tools/call",
                json!({ "name": "signal_user", "arguments": { "message": "hi" } }),
            ),
            None,
            "/cwd",
        );
        assert!(outcome.outgoing.is_none());
        assert!(outcome.reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("outside a taskspace"));
    }

    #[test]
    fn spawn_taskspace_carries_the_working_directory() {
        let outcome = handle(
            &request(
                "tools/call",
                json!({ "name": "spawn_taskspace", "arguments": { "name": "beta" } }),
            ),
            Some(TaskspaceId::new()),
            "/home/u/taskspaces/x/clone",
        );
        match outcome.outgoing.expect("event").event {
            BusEvent::NewTaskspaceRequest { ref cwd, ref name, .. } => {
                assert_eq!(name, "beta");
                assert_eq!(cwd.as_deref(), Some("/home/u/taskspaces/x/clone"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_and_method_are_errors() {
        let uuid = Some(TaskspaceId::new());
        let outcome = handle(
            &request("tools/call", json!({ "name": "mystery", "arguments": {} })),
            uuid,
            "/cwd",
        );
        assert!(outcome.reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));

        let outcome = handle(&request("mystery/method", Value::Null), uuid, "/cwd");
        assert!(outcome.reply["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown method"));
    }
}
