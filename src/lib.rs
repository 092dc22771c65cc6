// tasktrack - personal task tracking with optimistic sync and undoable deletes

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod filter;
pub mod kv;
pub mod local;
pub mod models;
pub mod remote;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use api::{AuthApi, TasksApi};
pub use config::{BackendKind, Config};
pub use error::{ApiError, AuthError, StoreError};
pub use filter::{SortOrder, StatusFilter, count_tasks, visible_tasks};
pub use models::{AuthEvent, NewTask, Profile, Session, Task, User, now_ms};
pub use session::SessionProvider;
pub use store::{DEFAULT_UNDO_GRACE, TaskStore};
