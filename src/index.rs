use axum::{debug_handler, response::IntoResponse};

use crate::{include_res, Markdown};

#[debug_handler]
pub async fn index() -> impl IntoResponse {
    Markdown(include_res!(str, "/pages/index.md"))
}
