//! Dashboard
//!
//! Drives one signed-in user's bookmark list. The dashboard owns the session
//! context, the change-stream subscription and the reconciler, and is the only
//! thing that mutates the list: user actions go through the backend first and
//! are applied locally only once confirmed, remote events are applied as they
//! arrive. All of it runs on the caller's task, one operation at a time.

use crate::backend::Backend;
use crate::error::{DashboardError, FeedError, Mutation};
use crate::feed::Subscription;
use crate::model::{self, Bookmark, User};
use crate::reconciler::{BookmarkListReconciler, Outcome};

/// Identity of the signed-in user. Lives exactly as long as the dashboard.
#[derive(Debug, Clone)]
pub struct SessionContext {
    user: User,
}

impl SessionContext {
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

pub struct Dashboard<B: Backend> {
    backend: B,
    session: SessionContext,
    list: BookmarkListReconciler,
    subscription: Subscription,
    // set when the stream skipped events; cleared by a successful reload
    stale: bool,
}

impl<B: Backend> Dashboard<B> {
    /// Resolves the current user, subscribes to their changes and loads the
    /// list.
    pub async fn open(backend: B) -> Result<Self, DashboardError> {
        let user = backend
            .current_user()
            .await
            .map_err(DashboardError::fetch)?
            .ok_or(DashboardError::AuthRequired)?;

        // subscribe before the initial fetch so nothing committed in between
        // is missed; anything seen twice is absorbed by the reconciler
        let subscription = backend
            .subscribe_changes(&user.id)
            .await
            .map_err(DashboardError::fetch)?;

        let list = BookmarkListReconciler::new(user.id.clone());
        let mut dashboard = Dashboard {
            backend,
            session: SessionContext { user },
            list,
            subscription,
            stale: false,
        };

        if let Err(e) = dashboard.refresh().await {
            dashboard.subscription.unsubscribe();
            return Err(e);
        }

        tracing::info!(
            user_id = dashboard.session.user_id(),
            count = dashboard.list.len(),
            "dashboard opened"
        );
        Ok(dashboard)
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        self.list.snapshot()
    }

    pub fn get(&self, id: &str) -> Option<&Bookmark> {
        self.list.get(id)
    }

    pub fn is_loaded(&self) -> bool {
        self.list.is_loaded()
    }

    /// Reloads every row from the backend, replacing the list.
    pub async fn refresh(&mut self) -> Result<(), DashboardError> {
        let rows = self
            .backend
            .list_bookmarks(self.session.user_id())
            .await
            .map_err(DashboardError::fetch)?;
        self.list.load_all(rows);
        self.stale = false;
        Ok(())
    }

    /// True when events were skipped and the list still waits for a reload.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn lagged(&mut self, skipped: u64) {
        tracing::warn!(skipped, "change stream lagged, reloading");
        self.stale = true;
    }

    /// Creates a bookmark, or edits the one with id `editing`.
    pub async fn save(
        &mut self,
        editing: Option<&str>,
        title: &str,
        url: &str,
    ) -> Result<Bookmark, DashboardError> {
        model::validate(title, url).map_err(DashboardError::Validation)?;

        match editing {
            Some(id) => {
                let row = self
                    .backend
                    .update_bookmark(id, title, url)
                    .await
                    .map_err(|e| self.rejected(Mutation::Update, e))?;
                self.list.apply_local_update(row.clone());
                Ok(row)
            }
            None => {
                let row = self
                    .backend
                    .create_bookmark(self.session.user_id(), title, url)
                    .await
                    .map_err(|e| self.rejected(Mutation::Create, e))?;
                self.list.apply_local_insert(row.clone());
                Ok(row)
            }
        }
    }

    /// Deletes on the backend, then locally. A row the backend no longer has
    /// is removed locally as well.
    pub async fn delete(&mut self, id: &str) -> Result<(), DashboardError> {
        let removed = self
            .backend
            .delete_bookmark(id)
            .await
            .map_err(|e| self.rejected(Mutation::Delete, e))?;
        if !removed {
            tracing::debug!(id, "bookmark was already gone on the backend");
        }
        self.list.apply_local_delete(id);
        Ok(())
    }

    fn rejected(&self, op: Mutation, source: crate::error::BackendError) -> DashboardError {
        tracing::warn!(
            user_id = self.session.user_id(),
            op = %op,
            error = %crate::unpack_error(&source),
            "mutation rejected"
        );
        DashboardError::mutation(op, source)
    }

    /// Waits for the next remote change and applies it. A lagged stream is
    /// resynchronised with a full reload; a closed one is reported as
    /// [`DashboardError::StreamDisconnected`] and needs [`reconnect`](Self::reconnect).
    ///
    /// Cancel safe: if the future is dropped while reloading after a lag, the
    /// next call reloads before waiting for further events.
    pub async fn next_event(&mut self) -> Result<Outcome, DashboardError> {
        if !self.stale {
            match self.subscription.next().await {
                Ok(Some(event)) => {
                    let kind = event.kind();
                    let outcome = self.list.apply_remote_event(event);
                    tracing::debug!(kind = kind.as_str(), outcome = ?outcome, "remote change applied");
                    return Ok(outcome);
                }
                Ok(None) => return Err(DashboardError::StreamDisconnected),
                Err(FeedError::Lagged(skipped)) => self.lagged(skipped),
            }
        }

        self.refresh().await?;
        Ok(Outcome::Replaced)
    }

    /// Applies every change already queued, without waiting. Returns how many
    /// of them altered the list.
    pub async fn pump(&mut self) -> Result<usize, DashboardError> {
        let mut changed = 0;
        loop {
            if self.stale {
                self.refresh().await?;
                changed += 1;
            }
            match self.subscription.try_next() {
                Ok(Some(event)) => {
                    if self.list.apply_remote_event(event).changed() {
                        changed += 1;
                    }
                }
                Ok(None) => return Ok(changed),
                Err(FeedError::Lagged(skipped)) => self.lagged(skipped),
            }
        }
    }

    /// Replaces the subscription and reloads, recovering anything missed
    /// while disconnected.
    pub async fn reconnect(&mut self) -> Result<(), DashboardError> {
        self.subscription.unsubscribe();
        self.subscription = self
            .backend
            .subscribe_changes(self.session.user_id())
            .await
            .map_err(DashboardError::fetch)?;
        self.refresh().await
    }

    /// Releases the subscription but keeps the backend session.
    pub fn close(self) {
        self.subscription.unsubscribe();
    }

    /// Releases the subscription, ends the backend session and drops the list.
    pub async fn sign_out(self) -> Result<(), DashboardError> {
        self.subscription.unsubscribe();
        let user_id = self.session.user.id.clone();
        self.backend
            .sign_out()
            .await
            .map_err(DashboardError::fetch)?;
        tracing::info!(user_id = %user_id, "dashboard closed");
        Ok(())
    }
}
