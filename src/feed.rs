//! Change feed
//!
//! In-process push channel for bookmark row changes. Every accepted mutation is
//! published once; subscribers only see rows owned by the user they subscribed
//! for. A subscriber that falls behind the channel capacity gets
//! [`FeedError::Lagged`] and must reload its view, since the skipped events are
//! gone.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::model::Bookmark;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert(Bookmark),
    Update(Bookmark),
    Delete { id: String, user_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert(_) => ChangeKind::Insert,
            ChangeEvent::Update(_) => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            ChangeEvent::Insert(row) | ChangeEvent::Update(row) => &row.user_id,
            ChangeEvent::Delete { user_id, .. } => user_id,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert(row) | ChangeEvent::Update(row) => &row.id,
            ChangeEvent::Delete { id, .. } => id,
        }
    }
}

/// Publishing side of the feed. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    shutdown: CancellationToken,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        tracing::debug!(kind = event.kind().as_str(), id = event.id(), "publishing change");
        // no receivers is not an error, nobody is watching
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, owner: &str) -> Subscription {
        tracing::debug!(owner, "new change feed subscription");
        Subscription {
            rx: self.tx.subscribe(),
            owner: owner.to_string(),
            token: self.shutdown.child_token(),
        }
    }

    /// Ends every subscription, current and future.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side for one owner. Events for other owners are skipped.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
    owner: String,
    token: CancellationToken,
}

impl Subscription {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Waits for the next event for this owner. `Ok(None)` means the
    /// subscription is over and will never yield again.
    pub async fn next(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }

            let received = tokio::select! {
                _ = self.token.cancelled() => return Ok(None),
                received = self.rx.recv() => received,
            };

            match received {
                Ok(event) if event.owner() == self.owner => return Ok(Some(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(owner = %self.owner, skipped = n, "change feed subscriber lagged");
                    return Err(FeedError::Lagged(n));
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`]: `Ok(None)` when nothing
    /// is queued for this owner or the subscription is over.
    pub fn try_next(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }

            match self.rx.try_recv() {
                Ok(event) if event.owner() == self.owner => return Ok(Some(event)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => {
                    tracing::warn!(owner = %self.owner, skipped = n, "change feed subscriber lagged");
                    return Err(FeedError::Lagged(n));
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(None),
            }
        }
    }

    pub fn unsubscribe(&self) {
        tracing::debug!(owner = %self.owner, "change feed subscription released");
        self.token.cancel();
    }
}
