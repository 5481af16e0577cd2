//! HTTP handlers for the bookmark backend

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Redirect, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::stream;
use tracing::info;

use crate::api::{
    ApiResponse, OAuthCallback, SignInRequest, SignInResponse, bad_request, created, forbidden, internal_error, no_content,
    not_found, success, unauthorized,
};
use crate::auth;
use crate::backend::{Backend, LocalBackend};
use crate::config::Auth;
use crate::db::Database;
use crate::error::{BackendError, FeedError};
use crate::feed::ChangeFeed;
use crate::model::{NewBookmark, Provider, UpdateBookmark};
use crate::store::BookmarkStore;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub feed: ChangeFeed,
    pub auth: Arc<Auth>,
}

impl AppState {
    fn anonymous(&self) -> LocalBackend {
        LocalBackend::with_auth(self.db.clone(), self.feed.clone(), self.auth.clone())
    }

    /// Resolves the bearer token into a backend acting for its user.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<LocalBackend, Response> {
        let Some(token) = auth::bearer_token(headers) else {
            return Err(unauthorized("missing bearer token"));
        };

        match BookmarkStore::new(self.db.connection()).user_for_token(token).await {
            Ok(Some(user)) => Ok(LocalBackend::for_session(
                self.db.clone(),
                self.feed.clone(),
                self.auth.clone(),
                user,
                token.to_string(),
            )),
            Ok(None) => Err(unauthorized("invalid or expired session")),
            Err(e) => {
                tracing::error!("Failed to resolve session: {:#}", e);
                Err(internal_error("Failed to resolve session"))
            }
        }
    }
}

fn backend_error(action: &str, err: BackendError) -> Response {
    match err {
        BackendError::NotAuthenticated => unauthorized("sign-in required"),
        BackendError::SignInRejected(msg) => unauthorized(&msg),
        BackendError::Forbidden => forbidden("forbidden"),
        BackendError::NotFound(_) => not_found("Bookmark not found"),
        BackendError::Validation(msg) => bad_request(&msg),
        err @ BackendError::Storage(_) => {
            tracing::error!("Failed to {}: {}", action, crate::unpack_error(&err));
            internal_error(&format!("Failed to {}", action))
        }
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(ApiResponse { data: "ok" })
}

// ============================================================================
// Auth
// ============================================================================

pub async fn start_oauth(State(state): State<AppState>, Path(provider): Path<String>) -> Response {
    let Some(provider) = Provider::from_str(&provider) else {
        return not_found("Unknown provider");
    };

    match state.anonymous().sign_in_with_oauth(provider).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(BackendError::Validation(_)) => not_found("Provider not configured"),
        Err(e) => backend_error("start sign-in", e),
    }
}

/// Provider redirect target: `?code=..&state=..`, or `?error=..` when the
/// user declined.
pub async fn oauth_callback(State(state): State<AppState>, Query(params): Query<OAuthCallback>) -> Response {
    if let Some(error) = params.error {
        info!(error = %error, "oauth sign-in declined at provider");
        return unauthorized("sign-in was declined");
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return bad_request("code and state are required");
    };

    match state.anonymous().complete_oauth(&oauth_state, &code).await {
        Ok((user, token)) => success(SignInResponse { token, user }),
        Err(e) => backend_error("complete sign-in", e),
    }
}

/// Signs in as whoever the caller names. Only served when
/// `auth.allow_dev_sessions` is set.
pub async fn create_session(State(state): State<AppState>, Json(payload): Json<SignInRequest>) -> Response {
    if !state.auth.allow_dev_sessions {
        return not_found("Not found");
    }

    match state.anonymous().issue_session(payload.provider, &payload.subject).await {
        Ok((user, token)) => created(SignInResponse { token, user }),
        Err(e) => backend_error("sign in", e),
    }
}

pub async fn current_user(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match backend.current_user().await {
        Ok(Some(user)) => success(user),
        Ok(None) => unauthorized("sign-in required"),
        Err(e) => backend_error("get current user", e),
    }
}

pub async fn sign_out(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match backend.sign_out().await {
        Ok(()) => no_content(),
        Err(e) => backend_error("sign out", e),
    }
}

// ============================================================================
// Bookmarks
// ============================================================================

pub async fn list_bookmarks(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };
    let owner = match backend.current_user().await {
        Ok(Some(user)) => user.id,
        _ => return unauthorized("sign-in required"),
    };

    match backend.list_bookmarks(&owner).await {
        Ok(bookmarks) => success(bookmarks),
        Err(e) => backend_error("list bookmarks", e),
    }
}

pub async fn create_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewBookmark>,
) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };
    let owner = match backend.current_user().await {
        Ok(Some(user)) => user.id,
        _ => return unauthorized("sign-in required"),
    };

    match backend.create_bookmark(&owner, &payload.title, &payload.url).await {
        Ok(bookmark) => created(bookmark),
        Err(e) => backend_error("create bookmark", e),
    }
}

pub async fn update_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<UpdateBookmark>,
) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match backend.update_bookmark(&id, &payload.title, &payload.url).await {
        Ok(bookmark) => success(bookmark),
        Err(e) => backend_error("update bookmark", e),
    }
}

pub async fn delete_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match backend.delete_bookmark(&id).await {
        Ok(true) => no_content(),
        Ok(false) => not_found("Bookmark not found"),
        Err(e) => backend_error("delete bookmark", e),
    }
}

/// Server-sent events for the caller's rows. Event names are `insert`,
/// `update` and `delete`; `resync` means events were skipped and the client
/// has to reload.
pub async fn stream_changes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let backend = match state.authenticate(&headers).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };
    let owner = match backend.current_user().await {
        Ok(Some(user)) => user.id,
        _ => return unauthorized("sign-in required"),
    };
    let subscription = match backend.subscribe_changes(&owner).await {
        Ok(subscription) => subscription,
        Err(e) => return backend_error("subscribe", e),
    };

    info!(user_id = %owner, "change stream opened");
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = match subscription.next().await {
            Ok(Some(change)) => {
                let kind = change.kind();
                match Event::default().event(kind.as_str()).json_data(&change) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!("Failed to encode change event: {}", e);
                        Event::default().event("resync")
                    }
                }
            }
            Ok(None) => return None,
            Err(FeedError::Lagged(skipped)) => Event::default().event("resync").data(skipped.to_string()),
        };
        Some((Ok::<Event, Infallible>(event), subscription))
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::routes;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use axum::body::BodyDataStream;
    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app_with(auth: Auth, feed_capacity: usize) -> (Router, AppState) {
        let state = AppState {
            db: Arc::new(Database::open_in_memory().await.unwrap()),
            feed: ChangeFeed::new(feed_capacity),
            auth: Arc::new(auth),
        };
        (routes().with_state(state.clone()), state)
    }

    /// Router with dev sessions on, so tests can sign in by name.
    async fn app() -> (Router, AppState) {
        let auth = Auth {
            allow_dev_sessions: true,
            ..Auth::default()
        };
        app_with(auth, 64).await
    }

    async fn open_stream(app: &Router, token: &str) -> BodyDataStream {
        let request = Request::builder()
            .uri("/changes")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        response.into_body().into_data_stream()
    }

    async fn read_until(body: &mut BodyDataStream, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("no event within 5s")
                .expect("stream ended")
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(body) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn sign_in(app: &Router, subject: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/auth/session",
            None,
            Some(json!({ "provider": "github", "subject": subject })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let (app, _) = app().await;
        let (status, body) = call(&app, "GET", "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "ok");
    }

    #[tokio::test]
    async fn test_bookmarks_require_a_session() {
        let (app, _) = app().await;
        let (status, _) = call(&app, "GET", "/bookmarks", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", "/bookmarks", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let (app, _) = app().await;
        let token = sign_in(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            "/bookmarks",
            Some(&token),
            Some(json!({ "title": "Rust", "url": "https://rust-lang.org" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let created_at = body["data"]["created_at"].clone();

        let (status, body) = call(
            &app,
            "PUT",
            &format!("/bookmarks/{id}"),
            Some(&token),
            Some(json!({ "title": "Rust!", "url": "https://rust-lang.org" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["title"], "Rust!");
        assert_eq!(body["data"]["created_at"], created_at);

        let (status, body) = call(&app, "GET", "/bookmarks", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &format!("/bookmarks/{id}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "DELETE", &format!("/bookmarks/{id}"), Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blank_title_is_bad_request() {
        let (app, _) = app().await;
        let token = sign_in(&app, "alice").await;

        let (status, body) = call(
            &app,
            "POST",
            "/bookmarks",
            Some(&token),
            Some(json!({ "title": "", "url": "https://rust-lang.org" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "title must not be empty");
    }

    #[tokio::test]
    async fn test_users_cannot_touch_each_others_rows() {
        let (app, _) = app().await;
        let alice = sign_in(&app, "alice").await;
        let bob = sign_in(&app, "bob").await;

        let (_, body) = call(
            &app,
            "POST",
            "/bookmarks",
            Some(&alice),
            Some(json!({ "title": "mine", "url": "https://a.example" })),
        )
        .await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (_, body) = call(&app, "GET", "/bookmarks", Some(&bob), None).await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = call(
            &app,
            "PUT",
            &format!("/bookmarks/{id}"),
            Some(&bob),
            Some(json!({ "title": "theirs", "url": "https://b.example" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "DELETE", &format!("/bookmarks/{id}"), Some(&bob), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_mutations_reach_change_feed() {
        let (app, state) = app().await;
        let token = sign_in(&app, "alice").await;
        let (_, me) = call(&app, "GET", "/auth/user", Some(&token), None).await;
        let user_id = me["data"]["id"].as_str().unwrap().to_string();
        let mut subscription = state.feed.subscribe(&user_id);

        call(
            &app,
            "POST",
            "/bookmarks",
            Some(&token),
            Some(json!({ "title": "Rust", "url": "https://rust-lang.org" })),
        )
        .await;

        let event = subscription.try_next().unwrap().unwrap();
        assert_eq!(event.kind().as_str(), "insert");
        assert_eq!(event.owner(), user_id);
    }

    #[tokio::test]
    async fn test_sign_out_invalidates_token() {
        let (app, _) = app().await;
        let token = sign_in(&app, "alice").await;

        let (status, _) = call(&app, "POST", "/auth/signout", Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, "GET", "/auth/user", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth_redirect_for_unconfigured_provider() {
        let (app, _) = app().await;
        let (status, _) = call(&app, "GET", "/auth/oauth/github", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/auth/oauth/myspace", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_claimed_identity_gets_no_session_by_default() {
        let (app, state) = app_with(Auth::default(), 64).await;
        let (alice, _) = state.anonymous().issue_session(Provider::Github, "alice").await.unwrap();
        let backend = LocalBackend::for_session(
            state.db.clone(),
            state.feed.clone(),
            state.auth.clone(),
            alice.clone(),
            String::new(),
        );
        backend.create_bookmark(&alice.id, "secret", "https://private.example").await.unwrap();

        let (status, body) = call(
            &app,
            "POST",
            "/auth/session",
            None,
            Some(json!({ "provider": "github", "subject": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_oauth_callback_signs_in_provider_account() {
        let base = auth::fake_provider::start().await;
        let (app, _) = app_with(auth::fake_provider::auth(&base), 64).await;

        let request = Request::builder().uri("/auth/oauth/github").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with(&format!("{base}/authorize?")));
        let oauth_state = location
            .split(['?', '&'])
            .find_map(|pair| pair.strip_prefix("state="))
            .unwrap()
            .to_string();

        let callback = format!(
            "/auth/callback?code={}&state={oauth_state}",
            auth::fake_provider::GOOD_CODE
        );
        let (status, body) = call(&app, "GET", &callback, None, None).await;
        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["token"].as_str().unwrap().to_string();

        let (status, me) = call(&app, "GET", "/auth/user", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["data"]["subject"], auth::fake_provider::ACCOUNT_ID.to_string());

        // a state is good for one callback only
        let (status, _) = call(&app, "GET", &callback, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth_callback_rejects_incomplete_or_declined_requests() {
        let base = auth::fake_provider::start().await;
        let (app, _) = app_with(auth::fake_provider::auth(&base), 64).await;

        let (status, _) = call(&app, "GET", "/auth/callback?code=x", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "GET", "/auth/callback?code=x&state=forged", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, "GET", "/auth/callback?error=access_denied", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_change_stream_delivers_own_inserts() {
        let (app, _) = app().await;
        let alice = sign_in(&app, "alice").await;
        let bob = sign_in(&app, "bob").await;
        let mut stream = open_stream(&app, &alice).await;

        call(
            &app,
            "POST",
            "/bookmarks",
            Some(&bob),
            Some(json!({ "title": "bobs row", "url": "https://b.example" })),
        )
        .await;
        call(
            &app,
            "POST",
            "/bookmarks",
            Some(&alice),
            Some(json!({ "title": "Rust", "url": "https://rust-lang.org" })),
        )
        .await;

        let seen = read_until(&mut stream, r#""title":"Rust""#).await;
        assert!(seen.contains("event: insert"));
        assert!(seen.contains(r#""type":"insert""#));
        assert!(!seen.contains("bobs row"));
    }

    #[tokio::test]
    async fn test_change_stream_signals_resync_after_lag() {
        let (app, _) = app_with(
            Auth {
                allow_dev_sessions: true,
                ..Auth::default()
            },
            1,
        )
        .await;
        let token = sign_in(&app, "alice").await;
        let mut stream = open_stream(&app, &token).await;

        for i in 0..3 {
            call(
                &app,
                "POST",
                "/bookmarks",
                Some(&token),
                Some(json!({ "title": format!("b{i}"), "url": "https://x.example" })),
            )
            .await;
        }

        read_until(&mut stream, "event: resync").await;
    }

    #[tokio::test]
    async fn test_change_stream_ends_when_feed_closes() {
        let (app, state) = app().await;
        let token = sign_in(&app, "alice").await;
        let mut stream = open_stream(&app, &token).await;

        state.feed.close();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream did not end");
        assert!(next.is_none());
    }
}
