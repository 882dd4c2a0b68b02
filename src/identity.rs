use axum::{Json, Router, debug_handler, extract::State, routing::post};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;

use crate::appresult::{AppError, AppResult};
use crate::session::USER_ID;
use crate::store::Directory;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    user_id: i64,
}

#[derive(Serialize)]
struct UserResponse {
    user_id: i64,
    username: String,
}

#[debug_handler]
async fn register(
    State(directory): State<Directory>,
    session: Session,
    Json(RegisterRequest { username }): Json<RegisterRequest>,
) -> AppResult<Json<UserResponse>> {
    if username.trim().is_empty() {
        return Err(AppError::bad_request("username must not be empty"));
    }

    let user_id = match directory.create_user(&username).await {
        Ok(user_id) => user_id,
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            return Err(AppError::bad_request("username already taken"));
        }
        Err(err) => return Err(err.into()),
    };

    session.insert(USER_ID, user_id).await?;
    tracing::info!(user = user_id, %username, "user registered");

    Ok(Json(UserResponse { user_id, username }))
}

#[debug_handler]
async fn login(
    State(directory): State<Directory>,
    session: Session,
    Json(LoginRequest { user_id }): Json<LoginRequest>,
) -> AppResult<Json<UserResponse>> {
    let Some(user) = directory.get_user(user_id).await? else {
        return Err(AppError::bad_request("no such user"));
    };

    session.insert(USER_ID, user.id).await?;
    tracing::info!(user = user.id, "signed in");

    Ok(Json(UserResponse {
        user_id: user.id,
        username: user.username,
    }))
}

#[debug_handler]
async fn logout(session: Session) -> AppResult<()> {
    session.clear().await;
    Ok(())
}
