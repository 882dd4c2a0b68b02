use std::sync::Arc;
use std::time::Duration;

use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::hub::{AgentHandle, AgentId, Hub, OUTBOUND_QUEUE_CAPACITY, WireMessage};
use crate::session;
use crate::store::Directory;

/// A connection with no inbound frames (not even pings) for this long is
/// torn down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// The only thing a client may supply per frame. Server-assigned fields
/// (`sender_id`, `room_id`, `created_at`) are ignored if present.
#[derive(Deserialize)]
struct ClientFrame {
    content: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<Uuid>,
    State(directory): State<Directory>,
    State(hub): State<Hub>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = session::require_user(&session).await?;

    if !directory.is_member(user_id, room_id).await? {
        return Err(AppError::forbidden("not a member of this room"));
    }

    Ok(ws.on_upgrade(move |socket| agent(socket, directory, hub, user_id, room_id)))
}

/// One live connection: registered with the hub on entry, deregistered when
/// either loop ends, whichever way it ends.
async fn agent(socket: WebSocket, directory: Directory, hub: Hub, user_id: i64, room_id: Uuid) {
    let (socket_tx, socket_rx) = socket.split();
    let id = AgentId::next();
    let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    hub.register(AgentHandle {
        id,
        user_id,
        room_id,
        queue: queue_tx,
    });
    tracing::debug!(agent = id.as_u64(), user = user_id, room = %room_id, "agent connected");

    let mut send_task = tokio::spawn(send_loop(socket_tx, queue_rx));
    let mut recv_task = tokio::spawn(recv_loop(
        socket_rx,
        directory,
        hub.clone(),
        id,
        user_id,
        room_id,
    ));

    // whichever loop finishes first takes the other one down with it
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.deregister(id);
    tracing::debug!(agent = id.as_u64(), "agent closed");
}

async fn recv_loop(
    mut socket_rx: SplitStream<WebSocket>,
    directory: Directory,
    hub: Hub,
    id: AgentId,
    user_id: i64,
    room_id: Uuid,
) {
    loop {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, socket_rx.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                tracing::debug!(agent = id.as_u64(), %err, "read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(agent = id.as_u64(), "idle timeout");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // pings and pongs reset the idle timeout, nothing to relay
            _ => continue,
        };

        let Ok(ClientFrame { content }) = serde_json::from_str::<ClientFrame>(&text) else {
            tracing::warn!(agent = id.as_u64(), "undecodable frame, closing");
            break;
        };

        // persist first; a message no peer can replay from history must
        // never be delivered
        let created_at = match directory.append_message(room_id, user_id, &content).await {
            Ok(created_at) => created_at,
            Err(err) => {
                tracing::error!(agent = id.as_u64(), %err, "could not persist message");
                break;
            }
        };

        hub.forward(
            id,
            WireMessage {
                sender_id: user_id,
                room_id,
                content,
                created_at,
            },
        );
    }
}

async fn send_loop(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<Arc<WireMessage>>,
) {
    while let Some(message) = queue_rx.recv().await {
        let Ok(payload) = serde_json::to_string(&*message) else {
            continue;
        };
        if socket_tx.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }
}
