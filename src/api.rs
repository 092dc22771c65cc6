// Backend seams: row storage and authentication

use crate::error::{ApiError, AuthError};
use crate::models::{AuthEvent, NewTask, Profile, Session, Task};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Row storage for tasks and profiles.
///
/// Decouples the task store from the concrete backend: the hosted REST
/// service in `remote`, or the local JSON file in `local`.
#[async_trait]
pub trait TasksApi: Send + Sync {
    /// All tasks owned by `user_id`, newest first.
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, ApiError>;

    /// Insert one task, returning the stored row with backend-assigned id
    /// and timestamps.
    async fn insert_task(&self, new: NewTask) -> Result<Task, ApiError>;

    /// Set the completion flag by id. Matching zero rows is success.
    async fn set_completed(&self, id: &str, completed: bool) -> Result<(), ApiError>;

    /// Replace the title by id. Matching zero rows is success.
    async fn set_title(&self, id: &str, title: &str) -> Result<(), ApiError>;

    /// Delete by id. Idempotent; a missing id is success.
    async fn delete_task(&self, id: &str) -> Result<(), ApiError>;

    /// Delete every task owned by `user_id`, and nothing else.
    async fn clear_tasks(&self, user_id: &str) -> Result<(), ApiError>;

    /// The user's profile row, if one exists.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ApiError>;

    /// Upsert the profile username. A name already held by another user
    /// yields [`ApiError::Conflict`].
    async fn update_username(&self, user_id: &str, username: &str) -> Result<Profile, ApiError>;
}

/// Authentication provider.
///
/// State transitions (sign-in, sign-out, recovery-link exchange) are pushed
/// to subscribers as [`AuthEvent`]s in addition to being returned.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Register a new account. `username` travels as sign-up metadata and
    /// seeds the profile row.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<Session, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    /// End the current session. Succeeds even when nobody is signed in.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Ask the provider to email a reset link. `redirect_to` is where the
    /// link lands. Always succeeds for unknown emails (no account probing).
    async fn request_password_reset(&self, email: &str, redirect_to: &str)
    -> Result<(), AuthError>;

    /// Exchange an emailed recovery token for a session. Emits
    /// [`AuthEvent::PasswordRecovery`] on success.
    async fn verify_recovery(&self, token: &str) -> Result<Session, AuthError>;

    /// Change the signed-in user's password.
    async fn update_password(&self, new_password: &str) -> Result<(), AuthError>;

    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribe to auth state changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
