use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use data_model::{RpcResponse, CODE_FAILED, CODE_SUCCESS};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Header every inbound request (and outbound admin call) carries the shared
/// access token in.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// HTTP-level failure. The body is still the RPC envelope so admin-side
/// clients can parse every response the same way.
#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (
            self.status_code,
            Json(RpcResponse::failed(&self.message)),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunRequest {
    pub job_id: i64,
    pub log_id: i64,
    pub handler_name: String,
    #[serde(default)]
    pub params: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillRequest {
    pub job_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdleBeatRequest {
    pub job_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogRequest {
    pub job_id: i64,
    pub log_id: i64,
    #[serde(default)]
    pub from_line: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogContent {
    pub from_line: usize,
    pub to_line: usize,
    pub content: String,
    /// True once the worker is gone and the file holds everything it will.
    pub is_end: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub code: i32,
    pub msg: Option<String>,
    pub content: Option<LogContent>,
}

impl LogResponse {
    pub fn success(content: LogContent) -> Self {
        Self {
            code: CODE_SUCCESS,
            msg: None,
            content: Some(content),
        }
    }

    pub fn failed(msg: &str) -> Self {
        Self {
            code: CODE_FAILED,
            msg: Some(msg.to_string()),
            content: None,
        }
    }
}
