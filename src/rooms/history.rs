use axum::{
    Json, debug_handler,
    extract::{Path, State},
};
use tower_sessions::Session;
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::session;
use crate::store::{Directory, HistoryMessage};

/// Everything ever said in a room, ascending, for hydrating a freshly
/// opened view before the live connection takes over.
#[debug_handler]
pub(crate) async fn messages(
    Path(room_id): Path<Uuid>,
    State(directory): State<Directory>,
    session: Session,
) -> AppResult<Json<Vec<HistoryMessage>>> {
    let user_id = session::require_user(&session).await?;

    if !directory.is_member(user_id, room_id).await? {
        return Err(AppError::forbidden("not a member of this room"));
    }

    Ok(Json(directory.list_messages(room_id).await?))
}
