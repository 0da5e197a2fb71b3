use super::types::{ErrorResponse, ExecuteFailure, ExecuteRequest, ExecuteResponse};
use crate::{
    Error,
    executor::ExecuteResult,
    fsm::Machine,
    instance::{DurableInstance, InstanceRegistry},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub struct AppState<M: Machine> {
    pub registry: Arc<InstanceRegistry<M>>,
}

impl<M: Machine> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

pub async fn get_state<M: Machine>(
    State(app): State<AppState<M>>,
    Path(id): Path<String>,
) -> Result<Json<M::State>, HandlerError> {
    let instance = open(&app, &id).await?;
    Ok(Json(instance.state().await))
}

pub async fn execute<M: Machine>(
    State(app): State<AppState<M>>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest<M::Input>>,
) -> Result<Response, HandlerError> {
    info!(instance = %id, "Received input: {:?}", request.input);
    let instance = open(&app, &id).await?;

    match instance.execute(request.input).await {
        Ok(ExecuteResult::Success { state, output }) => {
            Ok(Json(ExecuteResponse { state, output }).into_response())
        }
        Ok(ExecuteResult::Failure {
            error,
            state,
            input,
        }) => {
            warn!(instance = %id, "Transition rejected: {}", error);
            Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ExecuteFailure {
                    error: error.to_string(),
                    state,
                    input,
                }),
            )
                .into_response())
        }
        Err(e) => {
            error!(instance = %id, "Failed to execute input: {}", e);
            Err(internal_error(e))
        }
    }
}

async fn open<M: Machine>(
    app: &AppState<M>,
    id: &str,
) -> Result<Arc<DurableInstance<M>>, HandlerError> {
    app.registry.get_or_open(id).await.map_err(|e| {
        error!(instance = %id, "Failed to open instance: {}", e);
        internal_error(e)
    })
}

fn internal_error(e: Error) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("Processing error: {}", e),
        }),
    )
}
