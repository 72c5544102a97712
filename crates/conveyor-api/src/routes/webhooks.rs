//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;
use conveyor_core::source::PushEvent;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// Handle GitHub webhook events.
///
/// Pushes to the tracked branch are submitted to the trigger queue; every
/// other event is acknowledged and ignored.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    info!(event = %event_type, "Received GitHub webhook");

    match event_type {
        "push" => {
            let push_event = PushEvent::from_github_payload(&payload)
                .ok_or_else(|| ApiError::BadRequest("malformed push payload".to_string()))?;
            let tracked = &state.pipeline().source.branch;
            let Some(trigger) = push_event.to_trigger(tracked) else {
                info!(
                    git_ref = %push_event.r#ref,
                    tracked = %tracked,
                    "Push does not update the tracked branch"
                );
                return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
            };
            info!(
                repo = %push_event.repository_full_name,
                sha = %push_event.after,
                pusher = %push_event.pusher,
                "Processing push event"
            );
            let outcome = state.queue.submit(trigger);
            Ok((StatusCode::ACCEPTED, Json(json!(outcome))))
        }
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
            Ok((StatusCode::OK, Json(json!({ "status": "pong" }))))
        }
        _ => {
            info!(event = %event_type, "Unhandled event type");
            Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))))
        }
    }
}

/// Verify a GitHub `X-Hub-Signature-256` header.
fn verify_github_signature(secret: &str, payload: &[u8], signature: Option<&str>) -> bool {
    let Some(hex_digest) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::router;
    use crate::routes::test_support::{json as body_json, state};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn push_payload(r#ref: &str) -> String {
        json!({
            "ref": r#ref,
            "before": "1111111111111111111111111111111111111111",
            "after": "9f8e7d6c5b4a39281706f5e4d3c2b1a098765432",
            "repository": { "full_name": "acme/shop" },
            "pusher": { "name": "octocat" },
        })
        .to_string()
    }

    fn sign(secret: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn request(event: &str, body: String, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhooks/github")
            .header("X-GitHub-Event", event)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("X-Hub-Signature-256", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[test]
    fn test_verify_signature() {
        let body = "payload";
        let signature = sign("s3cret", body);
        assert!(verify_github_signature("s3cret", body.as_bytes(), Some(&signature)));
        assert!(!verify_github_signature("other", body.as_bytes(), Some(&signature)));
        assert!(!verify_github_signature("s3cret", body.as_bytes(), None));
        assert!(!verify_github_signature("s3cret", body.as_bytes(), Some("sha256=zz")));
    }

    #[tokio::test]
    async fn test_push_to_tracked_branch_queues_run() {
        let state = state();
        let app = router(state.clone());
        let response = app
            .oneshot(request("push", push_payload("refs/heads/main"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "queued");
        let pending = state.queue.pending().unwrap();
        assert_eq!(
            pending.trigger.revision.as_deref(),
            Some("9f8e7d6c5b4a39281706f5e4d3c2b1a098765432")
        );
        assert_eq!(pending.trigger.actor.as_deref(), Some("octocat"));
    }

    #[tokio::test]
    async fn test_push_to_other_branch_is_ignored() {
        let state = state();
        let app = router(state.clone());
        let response = app
            .oneshot(request("push", push_payload("refs/heads/feature"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ignored");
        assert!(state.queue.pending().is_none());
    }

    #[tokio::test]
    async fn test_signature_required_when_secret_set() {
        let state = state().with_webhook_secret("s3cret");
        let body = push_payload("refs/heads/main");

        let response = router(state.clone())
            .oneshot(request("push", body.clone(), Some(sign("wrong", &body))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.queue.pending().is_none());

        let response = router(state.clone())
            .oneshot(request("push", body.clone(), Some(sign("s3cret", &body))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_malformed_push_payload() {
        let response = router(state())
            .oneshot(request("push", json!({ "ref": 1 }).to_string(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ping() {
        let response = router(state())
            .oneshot(request("ping", "{}".to_string(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
