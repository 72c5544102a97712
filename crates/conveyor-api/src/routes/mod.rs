//! API routes.

pub mod health;
pub mod runs;
pub mod stacks;
pub mod webhooks;

use crate::AppState;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/webhooks", webhooks::router())
        .route("/ws", get(ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/runs", runs::router())
        .nest("/stacks", stacks::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::AppState;
    use axum::body::{Body, to_bytes};
    use axum::http::Response;
    use conveyor_config::{SystemConfig, parse_pipeline};
    use conveyor_scheduler::{EventBus, RunOverrides, TriggerQueue, build_orchestrator};
    use serde_json::Value;
    use std::sync::Arc;

    const PIPELINE: &str = r#"
        pipeline "shop"
        source {
            branch "main"
        }
        build {
            image-repository "registry.local/shop"
        }
        stack "web" needs="api"
        stack "api" needs="auth" {
            parameter "UserPool" "${stacks.auth.UserPoolId}"
        }
        stack "auth" {
            output "UserPoolId"
        }
    "#;

    /// State with a queue nobody drains, so submitted triggers stay pending.
    pub fn state() -> AppState {
        let overrides = RunOverrides {
            source_dir: Some(std::env::temp_dir()),
            ..Default::default()
        };
        let orchestrator = build_orchestrator(
            parse_pipeline(PIPELINE).unwrap(),
            &SystemConfig::default(),
            overrides,
            EventBus::default(),
        )
        .unwrap();
        AppState::new(Arc::new(orchestrator), Arc::new(TriggerQueue::new(10)))
    }

    pub async fn json(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
