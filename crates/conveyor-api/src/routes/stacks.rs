//! Stack endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::AppState;
use crate::error::ApiError;
use conveyor_core::graph::resolve_order;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_stacks))
}

#[derive(Debug, Serialize)]
struct StackResponse {
    name: String,
    depends_on: Vec<String>,
    outputs: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
}

/// Stacks in deploy order.
async fn list_stacks(State(state): State<AppState>) -> Result<Json<Vec<StackResponse>>, ApiError> {
    let order = resolve_order(&state.pipeline().stacks)?;
    Ok(Json(
        order
            .into_iter()
            .map(|s| StackResponse {
                name: s.name,
                depends_on: s.depends_on,
                outputs: s.resource_outputs,
                parameters: s.parameters,
            })
            .collect(),
    ))
}
