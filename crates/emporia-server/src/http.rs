use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use emporia_types::{ChatRequest, EngineEvent, TurnEvent};

use crate::AppState;

pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/events", get(events))
        .route("/conversations/{id}/messages", get(conversation_messages))
        .route("/conversations/{id}/cancel", post(cancel_conversation))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "index_ready": state.search.is_ready().await,
    }))
}

/// One user turn. The reply is an SSE stream of `TurnEvent`s, terminated by
/// a `done` event. The conversation id (generated when the client sent none)
/// comes back in the `x-conversation-id` header so the client can continue
/// the thread.
async fn chat(
    State(state): State<AppState>,
    Json(mut request): Json<ChatRequest>,
) -> impl IntoResponse {
    let conversation_id = request
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    request.conversation_id = Some(conversation_id.clone());

    let (tx, rx) = mpsc::channel::<TurnEvent>(64);
    let agent = state.agent.clone();
    tokio::spawn(async move {
        if let Err(err) = agent.run_turn(request, tx).await {
            tracing::error!("turn failed: {err:#}");
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)));

    ([("x-conversation-id", conversation_id)], sse)
}

/// Global firehose of engine events, for dashboards and debugging.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({})))
            .unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => Some(Ok(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default())
        )),
        Err(_) => None,
    });
    Sse::new(initial.chain(live)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let messages = state
        .store
        .recent_messages(&id, 200)
        .await
        .map_err(|err| {
            tracing::error!("failed to load messages: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    let rendered = messages
        .into_iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect::<Vec<_>>();
    Ok(Json(json!({
        "conversation_id": id,
        "messages": rendered,
    })))
}

async fn cancel_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Value> {
    let cancelled = state.cancellations.cancel(&id).await;
    Json(json!({ "ok": true, "cancelled": cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use emporia_catalog::CatalogClient;
    use emporia_core::{AgentLoop, CancellationRegistry, EventBus};
    use emporia_index::{OpenAiEmbedder, SearchService};
    use emporia_providers::{ProviderRegistry, ProvidersConfig};
    use emporia_store::Store;
    use emporia_tools::{ToolRegistry, ToolServices};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> AppState {
        let store = Arc::new(Store::in_memory().await.expect("store"));
        let embedder = Arc::new(OpenAiEmbedder::new(
            "http://127.0.0.1:9",
            None,
            "test-model",
            4,
        ));
        let search = Arc::new(SearchService::new(embedder, dir.to_path_buf()));
        let services = Arc::new(ToolServices {
            search: search.clone(),
            store: store.clone(),
            catalog: Arc::new(CatalogClient::new("http://127.0.0.1:9")),
        });
        let event_bus = EventBus::new();
        let cancellations = CancellationRegistry::new();
        // An empty providers config resolves to the local echo provider, so
        // no test ever talks to the network.
        let agent = Arc::new(AgentLoop::new(
            ProviderRegistry::new(ProvidersConfig::default()),
            ToolRegistry::new(services),
            store.clone(),
            event_bus.clone(),
            cancellations.clone(),
            None,
            None,
        ));
        AppState {
            agent,
            store,
            search,
            event_bus,
            cancellations,
        }
    }

    #[tokio::test]
    async fn health_reports_index_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_router(test_state(dir.path()).await);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["index_ready"], false);
    }

    #[tokio::test]
    async fn chat_streams_turn_events_and_returns_conversation_header() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_router(test_state(dir.path()).await);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let conversation_id = resp
            .headers()
            .get("x-conversation-id")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(!conversation_id.is_empty());

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let raw = String::from_utf8_lossy(&body);
        assert!(raw.contains(r#""type":"token""#));
        assert!(raw.contains("Echo: hello"));
        assert!(raw.contains(r#""type":"done""#));
    }

    #[tokio::test]
    async fn conversation_messages_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state
            .store
            .record_exchange("conv-7", "hi there", "hello!")
            .await
            .unwrap();
        let app = app_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/conversations/conv-7/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "hi there");
        assert_eq!(payload["messages"][1]["role"], "assistant");
    }

    #[tokio::test]
    async fn cancel_route_reports_whether_a_turn_was_live() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.cancellations.register("conv-9").await;
        let app = app_router(state);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/conversations/conv-9/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["cancelled"], true);
    }
}
