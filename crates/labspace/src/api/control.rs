//! Control WebSocket.
//!
//! A caller drives its sessions over one long-lived socket. Session-addressed
//! commands carry the access code explicitly. When the socket goes away the
//! caller's connection-scoped sessions go with it.

use std::collections::BTreeMap;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{AppType, CommandOutput, DeleteStatus, SessionDescriptor, VolumeRequest};

use super::error::ApiError;
use super::handlers::{default_branch, default_expect_json, owned_session, validate_project};
use super::state::{AppState, CurrentUser};

/// Commands sent by the caller.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Launch {
        project: String,
        app_type: String,
        #[serde(default)]
        volumes: Vec<VolumeRequest>,
    },
    Exec {
        session_access_code: String,
        argv: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_expect_json")]
        expect_json: bool,
    },
    Commit {
        session_access_code: String,
        #[serde(default = "default_branch")]
        branch: String,
    },
    CopyDocs {
        session_access_code: String,
    },
    Delete {
        session_access_code: String,
    },
    Ping,
}

impl ControlCommand {
    fn session_access_code(&self) -> Option<&str> {
        match self {
            Self::Exec {
                session_access_code,
                ..
            }
            | Self::Commit {
                session_access_code,
                ..
            }
            | Self::CopyDocs {
                session_access_code,
            }
            | Self::Delete {
                session_access_code,
            } => Some(session_access_code),
            Self::Launch { .. } | Self::Ping => None,
        }
    }
}

/// Replies sent to the caller.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Launched {
        session: SessionDescriptor,
    },
    Result {
        session_access_code: String,
        output: Option<Value>,
    },
    Deleted {
        session_access_code: String,
        status: DeleteStatus,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_access_code: Option<String>,
        message: String,
    },
    Pong,
}

fn output_value(output: Option<CommandOutput>) -> Option<Value> {
    output.map(|output| match output {
        CommandOutput::Raw(text) => Value::String(text),
        CommandOutput::Json(value) => value,
    })
}

/// GET /api/control
pub async fn control_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Control connection from user {}", user.id());
    ws.on_upgrade(move |socket| handle_control_connection(socket, state, user))
}

async fn handle_control_connection(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg_result) = receiver.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("User {} closed control connection", user.id());
                break;
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary control message from {}", user.id());
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("Control connection error for user {}: {}", user.id(), e);
                break;
            }
        };

        let event = match serde_json::from_str::<ControlCommand>(text.as_str()) {
            Ok(command) => {
                let access_code = command.session_access_code().map(str::to_string);
                handle_command(&state, &user, command)
                    .await
                    .unwrap_or_else(|e| ControlEvent::Error {
                        session_access_code: access_code,
                        message: e.to_string(),
                    })
            }
            Err(e) => {
                warn!("Unparseable control message from {}: {}", user.id(), e);
                ControlEvent::Error {
                    session_access_code: None,
                    message: format!("invalid command: {}", e),
                }
            }
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize control event: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    let deleted = state.registry.delete_connection_scoped(user.id()).await;
    info!(
        "Control connection closed for user {}, {} session(s) removed",
        user.id(),
        deleted.len()
    );
}

async fn handle_command(
    state: &AppState,
    user: &CurrentUser,
    command: ControlCommand,
) -> Result<ControlEvent, ApiError> {
    let event = match command {
        ControlCommand::Ping => ControlEvent::Pong,
        ControlCommand::Launch {
            project,
            app_type,
            volumes,
        } => {
            validate_project(&project)?;
            let app_type: AppType = app_type.parse()?;
            let session = state
                .registry
                .launch_session(&user.0, &project, app_type, VolumeRequest::resolve(volumes))
                .await?;
            ControlEvent::Launched {
                session: session.descriptor(),
            }
        }
        ControlCommand::Exec {
            session_access_code,
            argv,
            env,
            expect_json,
        } => {
            if argv.is_empty() {
                return Err(ApiError::bad_request("argv cannot be empty"));
            }
            let session = owned_session(state, user, &session_access_code)?;
            let env: Vec<(String, String)> = env.into_iter().collect();
            let output = session.run_command(&argv, &env, expect_json).await;
            ControlEvent::Result {
                session_access_code,
                output: output_value(output),
            }
        }
        ControlCommand::Commit {
            session_access_code,
            branch,
        } => {
            let session = owned_session(state, user, &session_access_code)?;
            let body = session.commit(&branch).await;
            ControlEvent::Result {
                session_access_code,
                output: body.map(Value::String),
            }
        }
        ControlCommand::CopyDocs {
            session_access_code,
        } => {
            let session = owned_session(state, user, &session_access_code)?;
            let output = session.copy_uploaded_docs().await;
            ControlEvent::Result {
                session_access_code,
                output: output_value(output),
            }
        }
        ControlCommand::Delete {
            session_access_code,
        } => {
            owned_session(state, user, &session_access_code)?;
            let status = state.registry.delete_session(&session_access_code).await?;
            ControlEvent::Deleted {
                session_access_code,
                status,
            }
        }
    };
    Ok(event)
}
