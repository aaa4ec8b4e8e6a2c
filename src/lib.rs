pub mod appresult;
pub mod config;
pub mod db;
pub mod index;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod res;
pub mod rooms;

use std::{ops::Deref, sync::Arc};

use axum::{extract::FromRef, response::{Html, IntoResponse}, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
use db::SqliteMessageStore;
use relay::Relay;

pub type SharedRelay = Arc<Relay<SqliteMessageStore>>;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub relay: SharedRelay,
}

impl AppState {
    pub fn new(store: SqliteMessageStore, outbox_capacity: usize) -> Self {
        Self {
            relay: Arc::new(Relay::new(store, outbox_capacity)),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(index::index))
        .merge(rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub struct Markdown<T>(pub T);

impl<T> IntoResponse for Markdown<T>
where
    T: Deref<Target = str>
{
    fn into_response(self) -> axum::response::Response {
        use pulldown_cmark::{Parser, Options};

        let parser = Parser::new_ext(&*self.0, Options::ENABLE_TABLES);

        let mut html_output = String::new();
        pulldown_cmark::html::push_html(&mut html_output, parser);
        Html(html_output).into_response()
    }
}
