mod history;
mod list;
mod new;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list::rooms))
        .route("/new", post(new::start_chat))
        .route("/{room_id}/messages", get(history::messages))
        .route("/{room_id}/ws", get(ws::room_ws))
}
