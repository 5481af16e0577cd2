use axum::{
    Router,
    routing::{get, post, put},
};

use crate::handler::{self, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handler::healthcheck))
        .route("/auth/oauth/:provider", get(handler::start_oauth))
        .route("/auth/callback", get(handler::oauth_callback))
        .route("/auth/session", post(handler::create_session))
        .route("/auth/user", get(handler::current_user))
        .route("/auth/signout", post(handler::sign_out))
        .route("/bookmarks", get(handler::list_bookmarks).post(handler::create_bookmark))
        .route("/changes", get(handler::stream_changes))
        .route(
            "/bookmarks/:id",
            put(handler::update_bookmark).delete(handler::delete_bookmark),
        )
}
