//! Backend collaborator
//!
//! [`Backend`] is everything the dashboard needs from the outside world:
//! session identity, row CRUD with server-assigned ids and timestamps, and a
//! per-owner change stream. [`LocalBackend`] provides it in-process on top of
//! the database and the change feed; the HTTP handlers expose the same
//! operations to remote clients.

use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::auth;
use crate::config::Auth;
use crate::db::Database;
use crate::error::BackendError;
use crate::feed::{ChangeEvent, ChangeFeed, Subscription};
use crate::model::{Bookmark, NewBookmark, Provider, UpdateBookmark, User};
use crate::store::BookmarkStore;

pub trait Backend {
    fn current_user(&self) -> impl Future<Output = Result<Option<User>, BackendError>>;

    /// Returns the provider URL the user has to visit to sign in.
    fn sign_in_with_oauth(&self, provider: Provider) -> impl Future<Output = Result<String, BackendError>>;

    fn sign_out(&self) -> impl Future<Output = Result<(), BackendError>>;

    fn list_bookmarks(&self, owner: &str) -> impl Future<Output = Result<Vec<Bookmark>, BackendError>>;

    fn create_bookmark(
        &self,
        owner: &str,
        title: &str,
        url: &str,
    ) -> impl Future<Output = Result<Bookmark, BackendError>>;

    fn update_bookmark(
        &self,
        id: &str,
        title: &str,
        url: &str,
    ) -> impl Future<Output = Result<Bookmark, BackendError>>;

    /// `Ok(false)` when there was no such row; deleting is idempotent.
    fn delete_bookmark(&self, id: &str) -> impl Future<Output = Result<bool, BackendError>>;

    fn subscribe_changes(&self, owner: &str) -> impl Future<Output = Result<Subscription, BackendError>>;
}

struct SessionSlot {
    user: User,
    token: String,
}

/// In-process backend. Clones share the database, the feed and the session.
#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
    feed: ChangeFeed,
    auth: Arc<Auth>,
    http: reqwest::Client,
    session: Arc<RwLock<Option<SessionSlot>>>,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, feed: ChangeFeed, auth: Auth) -> Self {
        Self::with_auth(db, feed, Arc::new(auth))
    }

    pub fn with_auth(db: Arc<Database>, feed: ChangeFeed, auth: Arc<Auth>) -> Self {
        Self {
            db,
            feed,
            auth,
            http: reqwest::Client::new(),
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// A backend acting for an already established session, as resolved from
    /// a bearer token.
    pub fn for_session(db: Arc<Database>, feed: ChangeFeed, auth: Arc<Auth>, user: User, token: String) -> Self {
        let backend = Self::with_auth(db, feed, auth);
        backend.replace_session(Some(SessionSlot { user, token }));
        backend
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Finds or creates the user the provider vouched for and opens a new
    /// session for it. Returns the user and the session's bearer token.
    pub async fn issue_session(&self, provider: Provider, subject: &str) -> Result<(User, String), BackendError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(BackendError::Validation("subject must not be empty".to_string()));
        }

        let store = BookmarkStore::new(self.db.connection());
        let user = store.find_or_create_user(provider, subject).await?;
        let token = store.create_session(&user.id).await?;

        tracing::info!(user_id = %user.id, provider = provider.as_str(), "signed in");
        Ok((user, token))
    }

    /// Handles the provider's redirect back to us: consumes the `state` issued
    /// by [`Backend::sign_in_with_oauth`], exchanges the code and opens a
    /// session for the account the provider reports.
    pub async fn complete_oauth(&self, state: &str, code: &str) -> Result<(User, String), BackendError> {
        let provider = BookmarkStore::new(self.db.connection())
            .take_oauth_state(state, auth::STATE_MAX_AGE_MINUTES)
            .await?
            .ok_or_else(|| BackendError::SignInRejected("unknown or expired sign-in state".to_string()))?;

        let subject = auth::exchange_code(&self.http, &self.auth, provider, code)
            .await
            .map_err(|e| {
                tracing::warn!(provider = provider.as_str(), error = %format!("{e:#}"), "oauth code exchange failed");
                BackendError::SignInRejected("provider did not confirm the sign-in".to_string())
            })?;

        self.issue_session(provider, &subject).await
    }

    /// Completes an OAuth sign-in and makes the user the current session,
    /// replacing any previous one.
    pub async fn complete_sign_in(&self, provider: Provider, subject: &str) -> Result<User, BackendError> {
        let (user, token) = self.issue_session(provider, subject).await?;

        let previous = self.replace_session(Some(SessionSlot {
            user: user.clone(),
            token,
        }));
        if let Some(previous) = previous {
            BookmarkStore::new(self.db.connection())
                .delete_session(&previous.token)
                .await?;
        }

        Ok(user)
    }

    fn replace_session(&self, slot: Option<SessionSlot>) -> Option<SessionSlot> {
        let mut guard = self.session.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, slot)
    }

    fn session_user(&self) -> Result<User, BackendError> {
        let guard = self.session.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .map(|slot| slot.user.clone())
            .ok_or(BackendError::NotAuthenticated)
    }

    fn authorize_owner(&self, owner: &str) -> Result<User, BackendError> {
        let user = self.session_user()?;
        if user.id != owner {
            return Err(BackendError::Forbidden);
        }
        Ok(user)
    }
}

impl Backend for LocalBackend {
    async fn current_user(&self) -> Result<Option<User>, BackendError> {
        match self.session_user() {
            Ok(user) => Ok(Some(user)),
            Err(BackendError::NotAuthenticated) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sign_in_with_oauth(&self, provider: Provider) -> Result<String, BackendError> {
        if !self.auth.providers.contains_key(&provider) {
            return Err(BackendError::Validation(format!(
                "provider {} is not configured",
                provider.as_str()
            )));
        }

        let state = BookmarkStore::new(self.db.connection())
            .create_oauth_state(provider)
            .await?;
        auth::authorize_url(&self.auth, provider, &state).ok_or_else(|| {
            BackendError::Validation(format!("provider {} is not configured", provider.as_str()))
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        if let Some(previous) = self.replace_session(None) {
            BookmarkStore::new(self.db.connection())
                .delete_session(&previous.token)
                .await?;
            tracing::info!(user_id = %previous.user.id, "signed out");
        }
        Ok(())
    }

    async fn list_bookmarks(&self, owner: &str) -> Result<Vec<Bookmark>, BackendError> {
        self.authorize_owner(owner)?;
        Ok(BookmarkStore::new(self.db.connection()).list_bookmarks(owner).await?)
    }

    async fn create_bookmark(&self, owner: &str, title: &str, url: &str) -> Result<Bookmark, BackendError> {
        self.authorize_owner(owner)?;
        let input = NewBookmark {
            title: title.to_string(),
            url: url.to_string(),
        };
        input.validate().map_err(BackendError::Validation)?;

        let _guard = self.db.write_lock().await;
        let row = BookmarkStore::new(self.db.connection())
            .create_bookmark(owner, input)
            .await?;
        self.feed.publish(ChangeEvent::Insert(row.clone()));
        Ok(row)
    }

    async fn update_bookmark(&self, id: &str, title: &str, url: &str) -> Result<Bookmark, BackendError> {
        let user = self.session_user()?;
        let input = UpdateBookmark {
            title: title.to_string(),
            url: url.to_string(),
        };
        input.validate().map_err(BackendError::Validation)?;

        let _guard = self.db.write_lock().await;
        let row = BookmarkStore::new(self.db.connection())
            .update_bookmark(id, &user.id, input)
            .await?
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        self.feed.publish(ChangeEvent::Update(row.clone()));
        Ok(row)
    }

    async fn delete_bookmark(&self, id: &str) -> Result<bool, BackendError> {
        let user = self.session_user()?;

        let _guard = self.db.write_lock().await;
        let removed = BookmarkStore::new(self.db.connection())
            .delete_bookmark(id, &user.id)
            .await?;
        if removed {
            self.feed.publish(ChangeEvent::Delete {
                id: id.to_string(),
                user_id: user.id,
            });
        }
        Ok(removed)
    }

    async fn subscribe_changes(&self, owner: &str) -> Result<Subscription, BackendError> {
        self.authorize_owner(owner)?;
        Ok(self.feed.subscribe(owner))
    }
}
