use axum::{Json, debug_handler, extract::State};
use tower_sessions::Session;

use crate::appresult::AppResult;
use crate::session;
use crate::store::{Directory, RoomEntry};

#[debug_handler]
pub(crate) async fn rooms(
    State(directory): State<Directory>,
    session: Session,
) -> AppResult<Json<Vec<RoomEntry>>> {
    let user_id = session::require_user(&session).await?;
    Ok(Json(directory.rooms_for_user(user_id).await?))
}
