//! HTTP command surface: current state, manual overrides, forced price
//! refresh, and the webhook listener devices push input changes to. All
//! command routes are guarded by the configured access key; webhooks from
//! on-LAN devices are not.

pub mod error;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::controller::{AppState, ControlEvent, OverrideRequest, StatusSnapshot};
use error::ApiError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/override/:output", post(override_output))
        .route("/api/v1/refresh", post(refresh))
        .route("/webhook", post(webhook))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.access_key else {
        return Ok(());
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusSnapshot>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.status_rx.borrow().clone()))
}

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub state: String,
    #[serde(default)]
    pub ttl_minutes: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
}

async fn override_output(
    State(state): State<AppState>,
    Path(output): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OverrideBody>,
) -> Result<Json<Accepted>, ApiError> {
    authorize(&state, &headers)?;
    if state.registry.output(&output).is_none() {
        return Err(ApiError::NotFound(format!("output {output}")));
    }
    let request = match body.state.to_ascii_lowercase().as_str() {
        "on" => OverrideRequest::On,
        "off" => OverrideRequest::Off,
        "auto" => OverrideRequest::Auto,
        other => {
            return Err(ApiError::BadRequest(format!(
                "state must be on, off or auto, not {other:?}"
            )))
        }
    };
    state
        .commands_tx
        .send(ControlEvent::Override {
            output,
            state: request,
            ttl_minutes: body.ttl_minutes,
        })
        .await
        .map_err(|_| ApiError::ServiceUnavailable("controller is shutting down".into()))?;
    Ok(Json(Accepted { status: "accepted" }))
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Accepted>, ApiError> {
    authorize(&state, &headers)?;
    state
        .refresh_tx
        .send(())
        .await
        .map_err(|_| ApiError::ServiceUnavailable("no price refresher running".into()))?;
    Ok(Json(Accepted { status: "accepted" }))
}

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub device: String,
    pub input: u8,
    pub state: bool,
}

async fn webhook(
    State(state): State<AppState>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<Accepted>, ApiError> {
    state
        .commands_tx
        .send(ControlEvent::Webhook {
            device: body.device,
            input: body.input,
            state: body.state,
        })
        .await
        .map_err(|_| ApiError::ServiceUnavailable("controller is shutting down".into()))?;
    Ok(Json(Accepted { status: "accepted" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};
    use tower::util::ServiceExt;

    fn test_state(access_key: Option<&str>) -> (AppState, mpsc::Receiver<ControlEvent>) {
        let yaml = r#"
general: {}
files:
  state_file: /tmp/pc-state.json
  price_cache_file: /tmp/pc-prices.json
shelly_devices:
  - name: shed
    host: 192.168.1.40
outputs:
  - name: pool-pump
    kind: switched
    device: shed
    relay: 0
operating_schedules: []
"#;
        let settings: crate::config::Settings = serde_yaml::from_str(yaml).unwrap();
        let registry = Arc::new(settings.resolve().unwrap());
        let (_status_tx, status_rx) = watch::channel(StatusSnapshot::startup());
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        (
            AppState {
                registry,
                status_rx,
                commands_tx,
                refresh_tx,
                access_key: access_key.map(String::from),
            },
            commands_rx,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = bearer {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn status_is_served() {
        let (state, _rx) = test_state(None);
        let app = router(state);
        let response = app
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn override_requires_access_key() {
        let (state, _rx) = test_state(Some("secret"));
        let app = router(state);

        let denied = app
            .clone()
            .oneshot(post_json(
                "/api/v1/override/pool-pump",
                serde_json::json!({"state": "on"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(post_json(
                "/api/v1/override/pool-pump",
                serde_json::json!({"state": "on"}),
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn override_enqueues_command() {
        let (state, mut rx) = test_state(None);
        let app = router(state);
        let response = app
            .oneshot(post_json(
                "/api/v1/override/pool-pump",
                serde_json::json!({"state": "off", "ttl_minutes": 90}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        match rx.recv().await.unwrap() {
            ControlEvent::Override {
                output,
                state,
                ttl_minutes,
            } => {
                assert_eq!(output, "pool-pump");
                assert_eq!(state, OverrideRequest::Off);
                assert_eq!(ttl_minutes, Some(90));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_output_is_404() {
        let (state, _rx) = test_state(None);
        let app = router(state);
        let response = app
            .oneshot(post_json(
                "/api/v1/override/toaster",
                serde_json::json!({"state": "on"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_override_state_is_400() {
        let (state, _rx) = test_state(None);
        let app = router(state);
        let response = app
            .oneshot(post_json(
                "/api/v1/override/pool-pump",
                serde_json::json!({"state": "maybe"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_forwards_input_state() {
        let (state, mut rx) = test_state(Some("secret"));
        let app = router(state);
        // Webhooks are not key-guarded.
        let response = app
            .oneshot(post_json(
                "/webhook",
                serde_json::json!({"device": "shed", "input": 1, "state": false}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        match rx.recv().await.unwrap() {
            ControlEvent::Webhook {
                device,
                input,
                state,
            } => {
                assert_eq!(device, "shed");
                assert_eq!(input, 1);
                assert!(!state);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
