//! HTTP control surface over the coordinator.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

use crate::config::ServerConfig;
use crate::services::arbitration::{ArbitrationChoice, ArbitrationError, ArbitrationService};
use crate::services::coordinator::{Coordinator, CoordinatorError, SubmitRequest};
use crate::services::jobs::TrackerError;
use crate::services::registry::ExtractorRegistry;

const HEALTHZ_PATH: &str = "/v1/healthz";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

/// Shared handles the routes close over.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub arbitration: Arc<ArbitrationService>,
    pub registry: ExtractorRegistry,
}

pub fn build_router(state: AppState) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route("/v1/extractors", get(list_extractors))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{job_id}", get(job_status))
        .route("/v1/jobs/{job_id}/result", get(job_result))
        .route("/v1/jobs/{job_id}/review", get(job_review))
        .route("/v1/jobs/{job_id}/arbitrate", post(job_arbitrate))
        .route("/v1/jobs/{job_id}/download/{artifact}", get(job_download))
        .with_state(state)
}

pub async fn serve(config: &ServerConfig, state: AppState) -> Result<(), ServerError> {
    debug_assert!(!config.listen_addr.contains('\n'));
    let listen_addr: SocketAddr =
        config
            .listen_addr
            .parse()
            .map_err(|source| ServerError::InvalidListenAddr {
                address: config.listen_addr.clone(),
                source,
            })?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.listen_addr.clone(),
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "concord server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_router(state);
    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    tracing::info!(?final_event, "server shutdown complete");
    Ok(())
}

async fn broadcast_shutdown(tx: watch::Sender<ShutdownEvent>) {
    let event = wait_for_signal().await;
    let _ = tx.send(event);
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownEvent {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(source) => {
            tracing::warn!(error = %source, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return ShutdownEvent::CtrlC;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownEvent::CtrlC,
        _ = sigterm.recv() => ShutdownEvent::SigTerm,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownEvent {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownEvent::CtrlC
}

fn drain_timeout_future(
    mut rx: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send {
    async move {
        loop {
            if *rx.borrow() != ShutdownEvent::Pending {
                break;
            }
            if rx.changed().await.is_err() {
                return std::future::pending::<()>().await;
            }
        }
        tokio::time::sleep(DRAIN_TIMEOUT).await;
    }
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn list_extractors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.all_info())
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.coordinator.submit(&request)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.status(&job_id)?))
}

async fn job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.result(&job_id)?))
}

async fn job_review(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.coordinator.review(&job_id)?))
}

#[derive(Debug, Deserialize)]
struct ArbitrateRequest {
    choices: Vec<ArbitrationChoice>,
}

#[derive(Debug, Serialize)]
struct ArbitrateResponse {
    state: String,
    choices_applied: usize,
}

async fn job_arbitrate(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<ArbitrateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .arbitration
        .arbitrate(&job_id, &request.choices)
        .await?;
    Ok(Json(ArbitrateResponse {
        state: record.state.as_ref().to_string(),
        choices_applied: request.choices.len(),
    }))
}

async fn job_download(
    State(state): State<AppState>,
    Path((job_id, artifact)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.coordinator.download(&job_id, &artifact)?;
    let content_type = match artifact.as_str() {
        "metadata" => "application/json",
        _ => "text/markdown; charset=utf-8",
    };
    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes))
}

/// Route-level error with a stable JSON shape.
#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Coordinator(CoordinatorError::InputRejected { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Coordinator(CoordinatorError::UnknownArtifact(_)) => StatusCode::BAD_REQUEST,
            ApiError::Coordinator(CoordinatorError::WrongState { .. }) => StatusCode::CONFLICT,
            ApiError::Coordinator(CoordinatorError::Tracker(TrackerError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Coordinator(CoordinatorError::Artifact { .. }) => StatusCode::NOT_FOUND,
            ApiError::Arbitration(ArbitrationError::Tracker(TrackerError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Arbitration(ArbitrationError::InvalidState { .. }) => StatusCode::CONFLICT,
            ApiError::Arbitration(
                ArbitrationError::MissingChoices(_)
                | ArbitrationError::UnknownDivergence(_)
                | ArbitrationError::InvalidChoice { .. },
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
