//! HTTP request and response types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gridrun_core::{AgentId, AgentInfo, CancelInfo, TaskProgress, TaskResult};
use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::instance::JoinOutcome;

// ============================================================================
// Agent protocol types
// ============================================================================

/// Response body for the register endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: AgentId,
}

/// Request body for the disconnect endpoint.
#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    pub agent_id: AgentId,
}

/// Request body for the progress endpoint.
#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub agent_id: AgentId,
    pub progress: TaskProgress,
}

/// Request body for the join endpoint.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub agent: AgentInfo,
    pub result: TaskResult,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub outcome: JoinOutcome,
}

/// Request body for the cancel endpoint.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub agent: AgentInfo,
    pub cancel: CancelInfo,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// True if the division went back to the queue.
    pub released: bool,
}

// ============================================================================
// Management protocol types
// ============================================================================

/// Request body for registering a repository unpacked under the root.
#[derive(Debug, Deserialize)]
pub struct AddRepositoryRequest {
    pub name: String,
}

/// Request body for launch and execute.
#[derive(Debug, Deserialize)]
pub struct LaunchRequest {
    pub master_id: String,
    pub slave_id: String,
    #[serde(default)]
    pub custom_data: String,
}

/// Request body for the schedule endpoint.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub repository: String,
    pub master_id: String,
    pub slave_id: String,
    /// Cron expression, seconds first.
    pub cron: String,
    #[serde(default)]
    pub custom_data: String,
}

/// Envelope of every management response.
#[derive(Debug, Serialize)]
pub struct ManagementResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ManagementResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error_code: None,
            message: None,
            data: Some(data),
        }
    }
}

impl<T: Serialize> IntoResponse for ManagementResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

// ============================================================================
// Error types
// ============================================================================

/// Error response for the agent endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A [`GridError`] rendered as a failed management response.
#[derive(Debug)]
pub struct ApiError(pub GridError);

impl From<GridError> for ApiError {
    fn from(error: GridError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GridError::TaskNotFound(_)
            | GridError::MasterNotFound(_)
            | GridError::SlaveNotFound(_)
            | GridError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
            GridError::WrongRole { .. }
            | GridError::InvalidArgument(_)
            | GridError::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
            GridError::RepositoryMarkedForRemoval(_) | GridError::CannotBeLoaded(_) => {
                StatusCode::CONFLICT
            }
            GridError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            GridError::Catalog(_) | GridError::Instance(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ManagementResponse::<()> {
            success: false,
            error_code: Some(self.0.code()),
            message: Some(self.0.to_string()),
            data: None,
        };
        (self.status(), Json(body)).into_response()
    }
}
