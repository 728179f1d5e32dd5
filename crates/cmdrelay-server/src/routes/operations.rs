//! Operation routes: `/operations/*`
//!
//! List the registry and invoke whitelisted operations.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};

use cmdrelay_core::registry::OperationDescription;
use cmdrelay_core::result::{ExecutionResult, Outcome};

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/operations` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_operations))
        .route("/{name}", post(invoke_operation))
}

#[derive(Debug, Serialize)]
pub struct OperationListResponse {
    pub operations: Vec<OperationDescription>,
}

/// Describe every registered operation and its parameters.
async fn list_operations(State(state): State<Arc<AppState>>) -> Json<OperationListResponse> {
    Json(OperationListResponse {
        operations: state.gateway.registry().describe(),
    })
}

/// Run one operation. The body is a JSON object of parameters; an empty
/// body means no parameters.
async fn invoke_operation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let params = parse_params(&body)?;
    let result = state.gateway.handle_request(&name, &params).await?;
    Ok((status_for(&result), Json(result)).into_response())
}

fn status_for(result: &ExecutionResult) -> StatusCode {
    match result.outcome {
        Outcome::Success | Outcome::Failure => StatusCode::OK,
        Outcome::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Outcome::Rejected => StatusCode::BAD_GATEWAY,
    }
}

fn parse_params(body: &[u8]) -> Result<Map<String, Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(AppError::InvalidParameter {
            parameter: "(body)".to_owned(),
            message: "invalid parameter '(body)': request body must be a JSON object".to_owned(),
        }),
        Err(e) => Err(AppError::BadRequest(format!("malformed JSON body: {e}"))),
    }
}
