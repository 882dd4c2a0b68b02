use tower_sessions::Session;

use crate::appresult::{AppError, AppResult};

pub const USER_ID: &str = "user_id";

pub async fn current_user(session: &Session) -> AppResult<Option<i64>> {
    Ok(session.get::<i64>(USER_ID).await?)
}

pub async fn require_user(session: &Session) -> AppResult<i64> {
    current_user(session)
        .await?
        .ok_or_else(|| AppError::unauthorized("not signed in"))
}
