use axum::{debug_handler, extract::{Path, State}, Json};

use crate::{relay::History, AppResult, SharedRelay};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    Path((user_id, receiver_id)): Path<(String, String)>,
    State(relay): State<SharedRelay>,
) -> AppResult<Json<History>> {
    Ok(Json(relay.history(&user_id, &receiver_id).await?))
}
