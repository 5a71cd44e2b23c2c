//! Control surface (C7): inbound, unauthenticated RPC methods that let an
//! external caller drive the orchestrator — register channels, flip
//! primary/standby, probe readiness, and force a restart.
//!
//! Exposed as a small `axum` service with no auth layer, not the larger
//! public API (auth, message history, purge) a sibling service might put
//! behind the same framework — this surface is purely operational.
//! `/metrics` is exposed alongside the control routes for the same reason
//! as always: one process, one listen address, one scrape target.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use prometheus::Encoder;
use tower_http::trace::TraceLayer;

use crate::event::IdentitySlim;
use crate::orchestrator::Orchestrator;

pub fn router(orchestrator: &'static Orchestrator) -> Router {
    Router::new()
        .route("/control/force-restart", post(force_restart))
        .route("/control/set-primary", post(set_primary))
        .route("/control/are-you-primary", get(are_you_primary))
        .route("/control/are-you-ready", get(are_you_ready))
        .route("/control/listen-to-channels", post(listen_to_channels))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// `force-restart(_) -> true`. Triggers the shared process closer; the
/// caller (a process supervisor) is expected to restart the process once it
/// exits.
async fn force_restart(State(orchestrator): State<&'static Orchestrator>) -> Json<bool> {
    tracing::warn!("force-restart received on control surface");
    orchestrator.request_shutdown();
    Json(true)
}

/// `set-primary(bool) -> bool`. Returns the *prior* value on a body that
/// doesn't decode as a JSON boolean; state is left unchanged in that case.
async fn set_primary(State(orchestrator): State<&'static Orchestrator>, body: String) -> Json<bool> {
    match serde_json::from_str::<bool>(&body) {
        Ok(value) => {
            orchestrator.set_primary(value);
            Json(value)
        }
        Err(e) => {
            tracing::warn!(error = %e, "set-primary: argument did not decode as bool");
            Json(orchestrator.is_primary())
        }
    }
}

/// `are-you-primary(_) -> bool`.
async fn are_you_primary(State(orchestrator): State<&'static Orchestrator>) -> Json<bool> {
    Json(orchestrator.is_primary())
}

/// `are-you-ready(_) -> bool`: true iff no listener in the pool currently
/// has channels waiting to be JOINed.
async fn are_you_ready(State(orchestrator): State<&'static Orchestrator>) -> Json<bool> {
    Json(orchestrator.are_you_ready().await)
}

/// `listen-to-channels([IdentitySlim]) -> true`. An empty list or a body
/// that fails to decode is an error; state is unchanged in either case.
async fn listen_to_channels(
    State(orchestrator): State<&'static Orchestrator>,
    body: String,
) -> Result<Json<bool>, (StatusCode, String)> {
    let identities: Vec<IdentitySlim> = serde_json::from_str(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to decode channel list: {e}")))?;

    if identities.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "listen-to-channels requires a non-empty list".to_owned(),
        ));
    }

    for identity in identities {
        orchestrator.listen_to_channel(identity).await;
    }

    Ok(Json(true))
}

async fn metrics() -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], buffer)
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex as StdMutex;
    use tower::ServiceExt;

    struct NullEventSink;
    #[async_trait]
    impl crate::sinks::EventSink for NullEventSink {
        async fn process_event(&self, _event: crate::event::Event) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    struct NullChatSink;
    #[async_trait]
    impl crate::sinks::ChatSink for NullChatSink {
        async fn twitch_chatter(&self, _raw: String) {}
        async fn im_here(&self, _alive: bool) {}
        fn is_connected(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    struct NullChattersSink(StdMutex<Vec<Vec<crate::event::ChattersBatch>>>);
    #[async_trait]
    impl crate::db::ChattersSink for NullChattersSink {
        async fn flush_chatters(&self, batches: &[crate::event::ChattersBatch]) -> Result<(), crate::db::StorageError> {
            self.0.lock().unwrap().push(batches.to_vec());
            Ok(())
        }
    }

    fn leak_orchestrator() -> &'static Orchestrator {
        Box::leak(Box::new(Orchestrator::new(
            1000,
            Box::new(NullEventSink),
            Box::new(NullChatSink),
            Box::new(NullChattersSink(StdMutex::new(Vec::new()))),
            tokio_util::sync::CancellationToken::new(),
        )))
    }

    #[tokio::test]
    async fn set_primary_decode_failure_returns_prior_value() {
        let orchestrator = leak_orchestrator();
        let app = router(orchestrator);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control/set-primary")
                    .header("content-type", "application/json")
                    .body(Body::from("not-a-bool"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"false");
        assert!(!orchestrator.is_primary());
    }

    #[tokio::test]
    async fn listen_to_channels_rejects_empty_list() {
        let orchestrator = leak_orchestrator();
        let app = router(orchestrator);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/control/listen-to-channels")
                    .header("content-type", "application/json")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn are_you_ready_true_when_pool_is_empty() {
        let orchestrator = leak_orchestrator();
        let app = router(orchestrator);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/control/are-you-ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"true");
    }
}
