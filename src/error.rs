// Error taxonomy for tasktrack

use thiserror::Error;

/// Authentication failures, local or hosted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Wrong email/password pair.
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// The backend enforces a 6-character minimum.
    #[error("Password should be at least 6 characters")]
    WeakPassword,

    #[error("An account with this email already exists")]
    EmailTaken,

    #[error("That username is already taken")]
    UsernameTaken,

    /// Unknown, already-used or timed-out recovery token.
    #[error("Recovery link is invalid or has expired")]
    RecoveryExpired,

    /// Operation needs an active session.
    #[error("No active session")]
    NotSignedIn,

    /// Anything else the provider reports.
    #[error("Auth provider error: {0}")]
    Provider(String),
}

impl AuthError {
    pub fn provider(msg: impl Into<String>) -> Self {
        AuthError::Provider(msg.into())
    }
}

/// Storage trouble inside an auth backend surfaces as a provider error.
impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        AuthError::Provider(err.to_string())
    }
}

/// Failures on the row-storage seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or concurrent-write violation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backend accepted the request but could not persist it.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backend could not be reached at all.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        ApiError::Storage(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        ApiError::Unavailable(msg.into())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

/// Which task mutation failed. Drives the user-facing failure line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Toggle,
    Rename,
    Delete,
    Clear,
}

impl MutationKind {
    /// The line shown to the user when this mutation fails.
    pub fn failure_message(self) -> &'static str {
        match self {
            MutationKind::Create => "Failed to create task.",
            MutationKind::Toggle => "Failed to toggle task.",
            MutationKind::Rename => "Failed to update task.",
            MutationKind::Delete => "Failed to delete task.",
            MutationKind::Clear => "Failed to clear tasks.",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            MutationKind::Create => "create",
            MutationKind::Toggle => "toggle",
            MutationKind::Rename => "rename",
            MutationKind::Delete => "delete",
            MutationKind::Clear => "clear",
        };
        write!(f, "{}", verb)
    }
}

/// What the task store surfaces to its caller. Display is the exact line a
/// user sees; the inner message keeps the backend detail for logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Failed to load tasks.")]
    Load(String),

    #[error("{}", .action.failure_message())]
    Mutation { action: MutationKind, message: String },
}

impl StoreError {
    pub fn mutation(action: MutationKind, err: &ApiError) -> Self {
        StoreError::Mutation {
            action,
            message: err.to_string(),
        }
    }

    /// Backend detail hidden behind the user-facing line.
    pub fn detail(&self) -> &str {
        match self {
            StoreError::Load(msg) => msg,
            StoreError::Mutation { message, .. } => message,
        }
    }
}
