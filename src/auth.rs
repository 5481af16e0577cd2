use anyhow::{Context, Result};
use axum::http::{
    HeaderMap,
    header::{ACCEPT, AUTHORIZATION, USER_AGENT},
};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Auth;
use crate::model::Provider;

/// Session tokens are stored as their SHA-256 hex digest.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// How long an issued `state` may wait for the provider's callback.
pub const STATE_MAX_AGE_MINUTES: u32 = 10;

/// Builds the provider's authorization URL the user is redirected to.
pub fn authorize_url(auth: &Auth, provider: Provider, state: &str) -> Option<String> {
    let cfg = auth.providers.get(&provider)?;

    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}",
        cfg.authorize_url,
        urlencoding::encode(&cfg.client_id),
        urlencoding::encode(&auth.redirect_url),
        urlencoding::encode(state),
    );
    if let Some(scope) = cfg.scope.as_deref().filter(|s| !s.is_empty()) {
        url.push_str("&scope=");
        url.push_str(&urlencoding::encode(scope));
    }
    Some(url)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Trades an authorization code for an access token, then asks the provider
/// who it belongs to. Returns the provider's account id.
pub async fn exchange_code(client: &reqwest::Client, auth: &Auth, provider: Provider, code: &str) -> Result<String> {
    let cfg = auth
        .providers
        .get(&provider)
        .with_context(|| format!("provider {} is not configured", provider.as_str()))?;

    let token: TokenResponse = client
        .post(&cfg.token_url)
        .header(ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", auth.redirect_url.as_str()),
            ("client_id", cfg.client_id.as_str()),
            ("client_secret", cfg.client_secret.as_str()),
        ])
        .send()
        .await
        .context("token request failed")?
        .error_for_status()
        .context("provider rejected the authorization code")?
        .json()
        .await
        .context("invalid token response")?;

    let info: Value = client
        .get(&cfg.userinfo_url)
        .bearer_auth(&token.access_token)
        .header(ACCEPT, "application/json")
        .header(USER_AGENT, "bookmarks")
        .send()
        .await
        .context("userinfo request failed")?
        .error_for_status()
        .context("provider rejected the access token")?
        .json()
        .await
        .context("invalid userinfo response")?;

    let field = cfg.subject_field.as_deref().unwrap_or(provider.subject_field());
    match info.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => anyhow::bail!("userinfo response has no '{}' field", field),
    }
}


/// A minimal OAuth provider on a local port: accepts one code, issues one
/// access token and reports one GitHub-style numeric account id.
#[cfg(test)]
pub(crate) mod fake_provider {
    use std::collections::HashMap;

    use axum::{
        Form, Json, Router,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use serde_json::{Value, json};

    use super::bearer_token;
    use crate::config::{Auth, OAuthProvider};
    use crate::model::Provider;

    pub const GOOD_CODE: &str = "good-code";
    pub const ACCOUNT_ID: u64 = 4242;
    const ACCESS_TOKEN: &str = "access-4242";

    async fn token(Form(form): Form<HashMap<String, String>>) -> Result<Json<Value>, StatusCode> {
        if form.get("code").map(String::as_str) != Some(GOOD_CODE) {
            return Err(StatusCode::BAD_REQUEST);
        }
        Ok(Json(json!({ "access_token": ACCESS_TOKEN, "token_type": "bearer" })))
    }

    async fn user(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
        if bearer_token(&headers) != Some(ACCESS_TOKEN) {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Json(json!({ "id": ACCOUNT_ID, "login": "octocat" })))
    }

    /// Serves the provider in the background and returns its base URL.
    pub async fn start() -> String {
        let app = Router::new().route("/token", post(token)).route("/user", get(user));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn auth(base: &str) -> Auth {
        let mut providers = HashMap::new();
        providers.insert(
            Provider::Github,
            OAuthProvider {
                authorize_url: format!("{base}/authorize"),
                token_url: format!("{base}/token"),
                userinfo_url: format!("{base}/user"),
                client_id: "bookmarks".to_string(),
                client_secret: "shh".to_string(),
                scope: None,
                subject_field: None,
            },
        );
        Auth {
            redirect_url: "http://localhost/auth/callback".to_string(),
            providers,
            allow_dev_sessions: false,
        }
    }
}
