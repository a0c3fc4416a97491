use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
    Router,
};
use data_model::{JobId, LogId, RpcResponse, CODE_SUCCESS};
use tower_http::trace::TraceLayer;

use crate::{
    config::ExecutorConfig,
    http_objects::{
        ApiError,
        IdleBeatRequest,
        KillRequest,
        LogContent,
        LogRequest,
        LogResponse,
        RunRequest,
        ACCESS_TOKEN_HEADER,
    },
    joblog,
    workers::WorkerRegistry,
};

#[derive(Clone)]
pub struct RouteState {
    pub workers: Arc<WorkerRegistry>,
    pub config: Arc<ExecutorConfig>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let access_token = route_state.config.access_token.clone();
    Router::new()
        .route("/", get(index))
        .route("/api/run", post(run_job).with_state(route_state.clone()))
        .route("/api/kill", post(kill_job).with_state(route_state.clone()))
        .route("/api/log", post(read_job_log).with_state(route_state.clone()))
        .route("/api/beat", post(beat))
        .route(
            "/api/idle-beat",
            post(idle_beat).with_state(route_state.clone()),
        )
        .layer(middleware::from_fn_with_state(
            access_token,
            validate_access_token,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
}

/// Rejects requests whose access token does not match the configured one.
/// An empty configured token disables the check.
async fn validate_access_token(
    State(expected): State<String>,
    request: Request,
    next: Next,
) -> Response {
    if expected.is_empty() {
        return next.run(request).await;
    }
    let provided = request
        .headers()
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        next.run(request).await
    } else {
        ApiError::unauthorized("access token mismatch").into_response()
    }
}

async fn index() -> &'static str {
    "Jobworks Executor"
}

async fn run_job(
    State(state): State<RouteState>,
    Json(request): Json<RunRequest>,
) -> Json<RpcResponse> {
    match state.workers.replace(
        JobId::new(request.job_id),
        &request.handler_name,
        request.params,
        LogId::new(request.log_id),
    ) {
        Ok(()) => Json(RpcResponse::success()),
        Err(e) => Json(RpcResponse::failed(e.to_string())),
    }
}

async fn kill_job(
    State(state): State<RouteState>,
    Json(request): Json<KillRequest>,
) -> Json<RpcResponse> {
    if state
        .workers
        .remove(JobId::new(request.job_id), "killed by admin")
    {
        Json(RpcResponse::success())
    } else {
        Json(RpcResponse {
            code: CODE_SUCCESS,
            msg: Some("no worker running for the job".to_string()),
        })
    }
}

async fn idle_beat(
    State(state): State<RouteState>,
    Json(request): Json<IdleBeatRequest>,
) -> Json<RpcResponse> {
    if state.workers.is_running(JobId::new(request.job_id)) {
        Json(RpcResponse::failed("job worker is running"))
    } else {
        Json(RpcResponse::success())
    }
}

async fn beat() -> Json<RpcResponse> {
    Json(RpcResponse::success())
}

async fn read_job_log(
    State(state): State<RouteState>,
    Json(request): Json<LogRequest>,
) -> Json<LogResponse> {
    let job_id = JobId::new(request.job_id);
    match joblog::read_log(
        &state.config.log_dir,
        job_id,
        LogId::new(request.log_id),
        request.from_line,
    )
    .await
    {
        Ok(slice) => {
            let is_end = !state.workers.is_running(job_id);
            Json(LogResponse::success(LogContent {
                from_line: slice.from_line,
                to_line: slice.to_line,
                content: slice.content,
                is_end,
            }))
        }
        Err(e) => Json(LogResponse::failed(&format!("{e:#}"))),
    }
}
