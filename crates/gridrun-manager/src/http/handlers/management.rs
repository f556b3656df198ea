//! Management protocol handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use gridrun_core::{GridTask, TaskInstanceId};
use serde::Serialize;
use tracing::info;

use crate::error::GridError;
use crate::http::responses::{
    AddRepositoryRequest, ApiError, LaunchRequest, ManagementResponse, ScheduleRequest,
};
use crate::instance::Completion;
use crate::manager::{GridSummary, RemovalOutcome};
use crate::state::AppState;

type ApiResult<T> = Result<ManagementResponse<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct Launched {
    pub instance_id: TaskInstanceId,
}

pub async fn grid_summary(State(state): State<Arc<AppState>>) -> ApiResult<GridSummary> {
    Ok(ManagementResponse::ok(state.manager.grid_summary().await))
}

pub async fn grid_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Vec<GridTask>> {
    Ok(ManagementResponse::ok(state.manager.grid_tasks(None)?))
}

pub async fn repository_tasks(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<GridTask>> {
    Ok(ManagementResponse::ok(state.manager.grid_tasks(Some(&name))?))
}

/// Register a repository already unpacked under the repository root.
pub async fn add_repository(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddRepositoryRequest>,
) -> ApiResult<Vec<GridTask>> {
    let name = req.name.trim();
    if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
        return Err(GridError::InvalidArgument(format!("invalid repository name '{}'", req.name)).into());
    }
    let directory = state.config().repository_path.join(name);
    let tasks = state.manager.add_task_libs(name, &directory).await?;
    info!(repository = name, tasks = tasks.len(), "Repository registered");
    Ok(ManagementResponse::ok(tasks))
}

pub async fn remove_repository(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<RemovalOutcome> {
    Ok(ManagementResponse::ok(
        state.manager.remove_task_repository(&name).await?,
    ))
}

pub async fn launch_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LaunchRequest>,
) -> ApiResult<Launched> {
    let instance = state
        .manager
        .launch_task(&req.master_id, &req.slave_id, &req.custom_data)
        .await?;
    Ok(ManagementResponse::ok(Launched {
        instance_id: instance.id().clone(),
    }))
}

/// Launch and hold the request until the instance completes.
pub async fn execute_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LaunchRequest>,
) -> ApiResult<Completion> {
    let completion = state
        .manager
        .execute_task(&req.master_id, &req.slave_id, &req.custom_data)
        .await?;
    Ok(ManagementResponse::ok(completion))
}

pub async fn abort_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    state.manager.abort_task(&TaskInstanceId::new(id)).await?;
    Ok(ManagementResponse::ok(()))
}

pub async fn schedule_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<()> {
    state.manager.schedule_task(
        &req.repository,
        &req.master_id,
        &req.slave_id,
        &req.cron,
        &req.custom_data,
    )?;
    Ok(ManagementResponse::ok(()))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use gridrun_core::PluginRegistry;

    use super::*;
    use crate::catalog::tests::write_repository;
    use crate::config::Config;

    fn state(root: &std::path::Path) -> Arc<AppState> {
        let mut plugins = PluginRegistry::new();
        gridrun_tasks::register(&mut plugins);
        let config = Config {
            repository_path: root.to_path_buf(),
            ..Config::default()
        };
        AppState::new(config, plugins)
    }

    #[tokio::test]
    async fn test_add_repository_from_root() {
        let root = tempfile::tempdir().unwrap();
        write_repository(root.path(), "Primes", "");
        let state = state(root.path());

        let response = add_repository(
            State(Arc::clone(&state)),
            Json(AddRepositoryRequest {
                name: "Primes".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.data.map(|tasks| tasks.len()), Some(2));

        let tasks = repository_tasks(State(state), Path("Primes".into()))
            .await
            .unwrap();
        assert!(tasks.success);
    }

    #[tokio::test]
    async fn test_path_like_names_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let state = state(root.path());

        let err = add_repository(
            State(state),
            Json(AddRepositoryRequest {
                name: "../etc".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_master_maps_to_not_found() {
        let root = tempfile::tempdir().unwrap();
        let state = state(root.path());

        let err = launch_task(
            State(state),
            Json(LaunchRequest {
                master_id: "missing".into(),
                slave_id: "missing.slave".into(),
                custom_data: String::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.code(), "MASTER_NOT_FOUND");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
