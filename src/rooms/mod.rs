pub mod key;
pub mod msg;
mod room;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::relay_ws))
        .route("/messages", post(msg::submit_msg))
        .route("/messages/{user_id}/{receiver_id}", get(room::history))
}
