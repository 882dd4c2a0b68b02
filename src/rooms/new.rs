use axum::{Json, debug_handler, extract::State};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::session;
use crate::store::Directory;

#[derive(Deserialize)]
pub(crate) struct StartChatRequest {
    peer_id: i64,
}

#[derive(Serialize)]
pub(crate) struct StartChatResponse {
    room_id: Uuid,
}

/// Open (or reopen) the room between the current user and a peer. Returns
/// the same room id no matter which side asks, and no matter how often.
#[debug_handler]
pub(crate) async fn start_chat(
    State(directory): State<Directory>,
    session: Session,
    Json(StartChatRequest { peer_id }): Json<StartChatRequest>,
) -> AppResult<Json<StartChatResponse>> {
    let user_id = session::require_user(&session).await?;

    if peer_id == user_id {
        return Err(AppError::bad_request("cannot open a room with yourself"));
    }
    if directory.get_user(peer_id).await?.is_none() {
        return Err(AppError::bad_request("no such user"));
    }

    let room_id = directory.find_or_create_room(user_id, peer_id).await?;
    Ok(Json(StartChatResponse { room_id }))
}
