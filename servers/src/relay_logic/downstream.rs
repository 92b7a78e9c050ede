//! Client-facing side: the pull endpoint, session management and the two
//! WebSocket flavours (on-demand and continuous).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use lib_relay::transports::{ContinuousFeed, InboundMessage, OnDemandChannel, PullAdapter};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::relay_logic::config::Config;
use crate::relay_logic::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub session: Option<String>,
    pub cadence_ms: Option<u64>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/snapshot", post(snapshot_handler))
        .route("/api/session/{id}", delete(delete_session_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/ws", get(ws_handler))
        .route("/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(config: Config, app_state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    if let Some((cert_path, key_path)) = config.tls_files() {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("Failed to load TLS configuration")?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        let cancel = app_state.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            tracing::info!("Downstream server shutting down.");
            signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        tracing::info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router(app_state).into_make_service())
            .await
            .context("Downstream TLS server failed")?;
    } else {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("Downstream server listening on http://{}", addr);
        serve(listener, app_state).await.context("Downstream server failed")?;
    }
    Ok(())
}

/// Plain HTTP on an already bound listener, until the state is cancelled.
pub async fn serve(listener: TcpListener, app_state: AppState) -> io::Result<()> {
    let shutdown = app_state.cancel.clone().cancelled_owned();
    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> impl IntoResponse {
    let adapter = PullAdapter::new(Arc::clone(&state.cache));
    let payload = adapter.handle(query.session.as_deref(), &body);
    ([(header::CONTENT_TYPE, "application/json")], payload)
}

async fn delete_session_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.cache.delete_session(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.cache.session_ids())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_on_demand(socket, state, query.session))
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state, query))
}

/// Picks the connection's session: the requested one, or a fresh per-connection id
/// that is dropped on disconnect.
fn connection_session(state: &AppState, requested: Option<String>) -> (String, bool) {
    match requested.filter(|s| !s.is_empty()) {
        Some(id) => (id, false),
        None => (state.next_anonymous_session(), true),
    }
}

/// The push cadence for one /stream connection, never faster than the server's floor.
fn stream_cadence(state: &AppState, requested_ms: Option<u64>) -> Duration {
    requested_ms
        .map(Duration::from_millis)
        .unwrap_or(state.stream_cadence)
        .max(state.min_stream_cadence)
}

async fn handle_on_demand(mut socket: WebSocket, state: AppState, session: Option<String>) {
    let (session_id, per_connection) = connection_session(&state, session);
    tracing::info!("On-demand client connected (session '{}')", session_id);
    let channel = OnDemandChannel::new(Arc::clone(&state.cache), session_id.clone());

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = channel.handle(text.as_str());
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        break; // client disconnected
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if per_connection {
        channel.close();
    }
    tracing::info!("On-demand client disconnected (session '{}')", session_id);
}

async fn handle_stream(socket: WebSocket, state: AppState, query: StreamQuery) {
    let (session_id, per_connection) = connection_session(&state, query.session);
    let cadence = stream_cadence(&state, query.cadence_ms);
    tracing::info!("Streaming client connected (session '{}', every {:?})", session_id, cadence);

    let (mut sink, mut stream) = socket.split();
    let (sub_tx, sub_rx) = mpsc::channel(8);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(8);

    let feed = ContinuousFeed::new(Arc::clone(&state.cache), session_id.clone(), cadence).delete_on_exit(per_connection);
    let feed_task = tokio::spawn(feed.run(sub_rx, out_tx, state.cancel.clone()));

    // Dropping `sub_tx` when the client goes away ends the feed.
    let reader_session = session_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    match InboundMessage::parse(text.as_str()).and_then(|m| m.subscriptions()) {
                        Ok(Some(request)) => {
                            if sub_tx.send(request).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Session '{}': {}", reader_session, e),
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    while let Some(payload) = out_rx.recv().await {
        if sink.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }
    drop(out_rx);
    reader.abort();
    if let Err(e) = feed_task.await {
        tracing::error!("Feed task for session '{}' failed: {}", session_id, e);
    }
    let _ = sink.close().await;
    tracing::info!("Streaming client disconnected (session '{}')", session_id);
}
