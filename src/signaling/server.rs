use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::broadcaster::{Broadcaster, BroadcasterHandle};
use super::peer::{PeerConnection, TransportFrame};
use super::registry::{Membership, RoomRegistry};
use super::types::{OutboundMessage, PeerId, RoomId, SignalingError};
use crate::config::BrokerConfig;

/// HTTP/WebSocket front end over the room registry and broadcaster
pub struct SignalingServer {
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<RoomRegistry>,
    broadcaster: BroadcasterHandle,
    config: Arc<BrokerConfig>,
}

impl SignalingServer {
    /// Initialize the registry and start the broadcaster and room reaper.
    /// Must be called inside a tokio runtime.
    pub async fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room_capacity));
        registry.init().await;

        let broadcaster = Broadcaster::spawn(Arc::clone(&registry), config.inbound_queue);
        tokio::spawn(reap_loop(Arc::clone(&registry), config.unclaimed_room_ttl));

        Self {
            state: AppState {
                registry,
                broadcaster,
                config: Arc::new(config),
            },
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.state.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/create", post(create_room))
            .route("/join", get(join_room))
            .route("/health", get(health))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

async fn reap_loop(registry: Arc<RoomRegistry>, ttl: std::time::Duration) {
    let mut interval = tokio::time::interval(ttl.max(std::time::Duration::from_secs(1)));
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = registry.reap_unclaimed(ttl).await;
        if removed > 0 {
            debug!("Reaped {} unclaimed room(s)", removed);
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    #[serde(alias = "roomID")]
    room: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreatedRoom {
    #[serde(rename = "roomID")]
    room_id: RoomId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        let status = match &self {
            SignalingError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            SignalingError::RoomFull(_) | SignalingError::RoomIdConflict(_) => {
                StatusCode::CONFLICT
            }
            SignalingError::AlreadyMember(_) => StatusCode::CONFLICT,
            SignalingError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            SignalingError::UnknownTarget(_)
            | SignalingError::NotInRoom(_)
            | SignalingError::ConnectionClosed
            | SignalingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_room(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
) -> Result<Json<CreatedRoom>, SignalingError> {
    let requested = query.room.as_deref().map(RoomId::parse).transpose()?;
    let room_id = state.registry.create_room(requested).await?;
    Ok(Json(CreatedRoom { room_id }))
}

async fn join_room(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, SignalingError> {
    let raw = query
        .room
        .ok_or_else(|| SignalingError::MalformedMessage("missing room parameter".to_string()))?;
    let room_id = RoomId::parse(&raw)?;

    let (peer, outbound) = PeerConnection::new(PeerId::generate(), state.config.outbound_buffer);
    let (membership, existing) = state.registry.join_room(&room_id, peer).await?;
    info!(
        "Peer {} admitted to room {} with {} existing peer(s)",
        membership.peer().id(),
        room_id,
        existing.len()
    );

    let broadcaster = state.broadcaster.clone();
    let heartbeat = state.config.heartbeat_interval;
    // if the upgrade never completes the guard is dropped with the closure
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, membership, outbound, broadcaster, heartbeat)
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let rooms = state.registry.room_count().await;
    Json(serde_json::json!({ "status": "ok", "rooms": rooms }))
}

async fn handle_socket(
    socket: WebSocket,
    membership: Membership,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    broadcaster: BroadcasterHandle,
    heartbeat: std::time::Duration,
) {
    let peer = Arc::clone(membership.peer());
    let (mut ws_tx, ws_rx) = socket.split();
    let waiting_for_pong = Arc::new(AtomicBool::new(false));

    info!("WebSocket connected: {}", peer.id());

    let writer = {
        let peer = Arc::clone(&peer);
        let waiting_for_pong = Arc::clone(&waiting_for_pong);
        tokio::spawn(async move {
            let mut ping_interval =
                tokio::time::interval(heartbeat.max(std::time::Duration::from_secs(1)));
            ping_interval.tick().await;
            loop {
                tokio::select! {
                    msg = outbound.recv() => {
                        let Some(msg) = msg else { break };
                        if ws_tx.send(Message::Text(msg.into_text())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if waiting_for_pong.swap(true, Ordering::AcqRel) {
                            warn!("No Pong received, disconnecting {}", peer.id());
                            break;
                        }
                        if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                        debug!("Ping sent to {}", peer.id());
                    }
                    _ = peer.closed() => break,
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            peer.close();
        })
    };

    let frames = {
        let waiting_for_pong = Arc::clone(&waiting_for_pong);
        ws_rx.filter_map(move |msg| {
            let frame = match msg {
                Ok(Message::Text(text)) => Some(Ok(TransportFrame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(TransportFrame::Binary(data))),
                Ok(Message::Close(_)) => Some(Ok(TransportFrame::Close)),
                Ok(Message::Pong(_)) => {
                    waiting_for_pong.store(false, Ordering::Release);
                    None
                }
                Ok(Message::Ping(_)) => None,
                Err(e) => Some(Err(e)),
            };
            futures_util::future::ready(frame)
        })
    };

    let mut inbound = peer.receive(frames);
    while let Some(item) = inbound.next().await {
        if let Err(e) = broadcaster.submit(item).await {
            warn!("Dropping connection {}: {}", peer.id(), e);
            break;
        }
    }

    membership.release().await;
    let _ = writer.await;
    info!("WebSocket disconnected: {}", peer.id());
}
