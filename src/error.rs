use thiserror::Error;

/// Failures reported by a [`crate::backend::Backend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no active session")]
    NotAuthenticated,
    #[error("sign-in rejected: {0}")]
    SignInRejected(String),
    #[error("rows of another user are not accessible")]
    Forbidden,
    #[error("bookmark {0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("storage error")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mutation::Create => write!(f, "create"),
            Mutation::Update => write!(f, "update"),
            Mutation::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("sign-in required")]
    AuthRequired,
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{op} rejected by backend")]
    MutationFailed {
        op: Mutation,
        #[source]
        source: BackendError,
    },
    #[error("failed to fetch bookmarks")]
    Fetch(#[source] BackendError),
    #[error("change stream disconnected")]
    StreamDisconnected,
}

impl DashboardError {
    pub(crate) fn mutation(op: Mutation, source: BackendError) -> Self {
        match source {
            BackendError::NotAuthenticated => DashboardError::AuthRequired,
            BackendError::Validation(msg) => DashboardError::Validation(msg),
            source => DashboardError::MutationFailed { op, source },
        }
    }

    pub(crate) fn fetch(source: BackendError) -> Self {
        match source {
            BackendError::NotAuthenticated => DashboardError::AuthRequired,
            source => DashboardError::Fetch(source),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("subscription lagged behind, {0} events skipped")]
    Lagged(u64),
}
