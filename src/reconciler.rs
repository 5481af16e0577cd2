//! Bookmark list reconciliation
//!
//! Keeps one user's bookmark list consistent while three sources write to it:
//! bulk reloads, local mutations the backend has already confirmed, and the
//! remote change stream (which may echo those same mutations, and may
//! redeliver events after a reconnect).
//!
//! Identity is always the bookmark id. Every operation is idempotent, so an
//! event applied twice, or applied once locally and once as a remote echo,
//! leaves the same list as applying it once.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::feed::ChangeEvent;
use crate::model::Bookmark;

/// What an operation did to the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Removed,
    Replaced,
    Unchanged,
}

impl Outcome {
    pub fn changed(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

/// Newest first; equal timestamps fall back to id so the order is total.
fn newest_first(a: &Bookmark, b: &Bookmark) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[derive(Debug)]
pub struct BookmarkListReconciler {
    owner: String,
    items: Vec<Bookmark>,
    loaded: bool,
}

impl BookmarkListReconciler {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            items: Vec::new(),
            loaded: false,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// False until the first [`load_all`](Self::load_all), so an empty list
    /// can be told apart from one that was never fetched.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn snapshot(&self) -> &[Bookmark] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Bookmark> {
        self.position(id).map(|i| &self.items[i])
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|b| b.id == id)
    }

    fn owns(&self, row: &Bookmark) -> bool {
        if row.user_id == self.owner {
            return true;
        }
        tracing::warn!(id = %row.id, owner = %row.user_id, "ignoring bookmark of another user");
        false
    }

    /// Replaces the whole list. Rows of other owners are dropped and a
    /// repeated id keeps its last occurrence.
    pub fn load_all(&mut self, rows: Vec<Bookmark>) -> Outcome {
        let mut by_id: HashMap<String, Bookmark> = HashMap::with_capacity(rows.len());
        for row in rows {
            if self.owns(&row) {
                by_id.insert(row.id.clone(), row);
            }
        }

        let mut items: Vec<Bookmark> = by_id.into_values().collect();
        items.sort_by(newest_first);

        self.items = items;
        self.loaded = true;
        tracing::debug!(count = self.items.len(), "bookmark list reloaded");
        Outcome::Replaced
    }

    /// Inserts a confirmed row at its sorted position unless the id is
    /// already present.
    pub fn apply_local_insert(&mut self, row: Bookmark) -> Outcome {
        if !self.owns(&row) || self.position(&row.id).is_some() {
            return Outcome::Unchanged;
        }

        let at = self
            .items
            .partition_point(|existing| newest_first(existing, &row) == Ordering::Less);
        self.items.insert(at, row);
        Outcome::Inserted
    }

    /// Takes title and url from `row` and keeps everything else, including
    /// the entry's position. Unknown ids are ignored: the row was deleted
    /// meanwhile, or was never seen in full.
    pub fn apply_local_update(&mut self, row: Bookmark) -> Outcome {
        if !self.owns(&row) {
            return Outcome::Unchanged;
        }

        let Some(i) = self.position(&row.id) else {
            tracing::debug!(id = %row.id, "dropping update for unknown bookmark");
            return Outcome::Unchanged;
        };

        let entry = &mut self.items[i];
        if entry.title == row.title && entry.url == row.url {
            return Outcome::Unchanged;
        }
        entry.title = row.title;
        entry.url = row.url;
        Outcome::Updated
    }

    pub fn apply_local_delete(&mut self, id: &str) -> Outcome {
        match self.position(id) {
            Some(i) => {
                self.items.remove(i);
                Outcome::Removed
            }
            None => Outcome::Unchanged,
        }
    }

    pub fn apply_remote_event(&mut self, event: ChangeEvent) -> Outcome {
        match event {
            ChangeEvent::Insert(row) => self.apply_local_insert(row),
            ChangeEvent::Update(row) => self.apply_local_update(row),
            ChangeEvent::Delete { id, .. } => self.apply_local_delete(&id),
        }
    }
}
