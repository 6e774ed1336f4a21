//! HTTP surface over an [`ExecutorService`].
//!
//! | Route | |
//! |---|---|
//! | `GET /api/kernels` | list kernels |
//! | `POST /api/kernels` | start a process kernel |
//! | `DELETE /api/kernels/{kernel_id}` | forget a kernel |
//! | `GET /api/kernels/{kernel_id}/execute` | in-flight `[{path, cell_id}]` |
//! | `POST /api/kernels/{kernel_id}/execute` | submit `{path?, cellId?, code?, block?, notWrite?}` |

use crate::{
    commands::{ExecutingCell, KernelInfo},
    error::ExecutorError,
    service::ExecutorService,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;

static KERNEL_ID: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^\w+-\w+-\w+-\w+-\w+$"));

fn check_kernel_id(kernel_id: &str) -> Result<(), ExecutorError> {
    let pattern = KERNEL_ID.as_ref().map_err(|e| ExecutorError::from(e.clone()))?;
    if pattern.is_match(kernel_id) {
        Ok(())
    } else {
        Err(ExecutorError::NotFound(format!(
            "Not a kernel id: {kernel_id}"
        )))
    }
}

pub fn router(service: Arc<ExecutorService>) -> Router {
    Router::new()
        .route("/api/kernels", get(list_kernels).post(start_kernel))
        .route("/api/kernels/:kernel_id", delete(shutdown_kernel))
        .route(
            "/api/kernels/:kernel_id/execute",
            get(executing_cells).post(execute),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve until `shutdown_signal` resolves.
pub async fn serve(
    service: Arc<ExecutorService>,
    addr: SocketAddr,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ExecutorError> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Kernel executor listening on http://{}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    tracing::info!("HTTP server shut down");
    Ok(())
}

async fn list_kernels(State(service): State<Arc<ExecutorService>>) -> Json<Vec<KernelInfo>> {
    Json(
        service
            .kernels()
            .list()
            .into_iter()
            .map(|id| KernelInfo { id })
            .collect(),
    )
}

async fn start_kernel(
    State(service): State<Arc<ExecutorService>>,
) -> Result<(StatusCode, Json<KernelInfo>), ExecutorError> {
    let id = service.kernels().start()?;
    Ok((StatusCode::CREATED, Json(KernelInfo { id })))
}

async fn shutdown_kernel(
    State(service): State<Arc<ExecutorService>>,
    Path(kernel_id): Path<String>,
) -> Result<StatusCode, ExecutorError> {
    check_kernel_id(&kernel_id)?;
    service.kernels().shutdown(&kernel_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn executing_cells(
    State(service): State<Arc<ExecutorService>>,
    Path(kernel_id): Path<String>,
) -> Result<Json<Vec<ExecutingCell>>, ExecutorError> {
    check_kernel_id(&kernel_id)?;
    Ok(Json(service.orchestrator().executing(&kernel_id).await))
}

async fn execute(
    State(service): State<Arc<ExecutorService>>,
    Path(kernel_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ExecutorError> {
    check_kernel_id(&kernel_id)?;
    let response = service.orchestrator().submit(&kernel_id, body).await?;
    tracing::debug!("execute on {}: {}", kernel_id, response);
    Ok(Json(response.into_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_id_pattern() {
        assert!(check_kernel_id("0f8fad5b-d9cb-469f-a165-70867728950e").is_ok());
        assert!(check_kernel_id("a-b-c-d-e").is_ok());
        assert!(matches!(
            check_kernel_id("not-a-kernel"),
            Err(ExecutorError::NotFound(_))
        ));
        assert!(check_kernel_id("a-b-c-d-e/../x").is_err());
    }
}
