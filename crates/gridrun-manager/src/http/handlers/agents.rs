//! Agent protocol handlers.
//!
//! Agents poll `descriptor` for work, run the job locally and hand the
//! outcome back through `join` or `cancel`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use gridrun_core::{AgentInfo, TaskDescriptor};
use tracing::{debug, warn};

use crate::http::responses::{
    CancelRequest, CancelResponse, DisconnectRequest, ErrorResponse, JoinRequest, JoinResponse,
    ProgressRequest, RegisterResponse,
};
use crate::state::AppState;

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(agent): Json<AgentInfo>,
) -> impl IntoResponse {
    let agent_id = state.manager.register(agent);
    Json(RegisterResponse { agent_id })
}

pub async fn ping(
    State(state): State<Arc<AppState>>,
    Json(agent): Json<AgentInfo>,
) -> impl IntoResponse {
    match state.manager.ping(agent) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DisconnectRequest>,
) -> impl IntoResponse {
    state.manager.disconnect(&req.agent_id).await;
    StatusCode::NO_CONTENT
}

pub async fn progress(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProgressRequest>,
) -> impl IntoResponse {
    state.manager.update_progress(&req.agent_id, req.progress);
    StatusCode::NO_CONTENT
}

/// Long poll for a job. Always answers with a well-formed descriptor.
pub async fn descriptor(
    State(state): State<Arc<AppState>>,
    Json(agent): Json<AgentInfo>,
) -> Json<TaskDescriptor> {
    debug!(agent_id = %agent.id, "Descriptor requested");
    Json(state.manager.get_descriptor(agent).await)
}

pub async fn join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    match state.manager.join(&req.agent.id, req.result).await {
        Ok(outcome) => Json(JoinResponse { outcome }).into_response(),
        Err(e) => {
            warn!(agent_id = %req.agent.id, error = %e, "Join refused");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    let released = state.manager.cancel(&req.agent.id, req.cancel).await;
    Json(CancelResponse { released })
}

#[cfg(test)]
mod tests {
    use gridrun_core::{AgentId, JobId, PluginRegistry, TaskInstanceId, TaskResult};

    use super::*;
    use crate::config::Config;
    use crate::instance::JoinOutcome;

    #[tokio::test]
    async fn test_register_assigns_id() {
        let state = AppState::new(Config::default(), PluginRegistry::new());
        let agent = AgentInfo::new(AgentId::default(), "node-a");

        let response = register(State(Arc::clone(&state)), Json(agent))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.manager.connected_agents(), 1);
    }

    #[tokio::test]
    async fn test_ping_without_id_is_rejected() {
        let state = AppState::new(Config::default(), PluginRegistry::new());
        let agent = AgentInfo::new(AgentId::default(), "node-a");

        let response = ping(State(state), Json(agent)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_join_of_unknown_instance_is_ignored() {
        let state = AppState::new(Config::default(), PluginRegistry::new());
        let req = JoinRequest {
            agent: AgentInfo::new(AgentId::new("a"), "node-a"),
            result: TaskResult {
                instance_id: TaskInstanceId::new("gone"),
                job_id: JobId::new(1),
                task_name: "PrimeFinder".into(),
                result: "[]".into(),
            },
        };

        let response = join(State(state), Json(req)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["outcome"], serde_json::json!(JoinOutcome::Ignored));
    }
}
