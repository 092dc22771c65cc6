// Data models for tasktrack

use serde::{Deserialize, Serialize};

/// A single to-do item owned by one user.
///
/// Field names match the hosted backend's row shape so records serialize
/// straight onto the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub completed: bool,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds.
    pub updated_at: i64,
}

/// Insert payload for a new task. The backend assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: String,
    pub title: String,
    pub completed: bool,
}

/// An authenticated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

/// An active sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
}

/// Row in the profiles relation, keyed by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: Option<String>,
}

/// Auth state transitions pushed to subscribers.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// Signed in (Some) or signed out (None).
    SessionChanged(Option<Session>),
    /// A recovery link was exchanged; the session may only change the password.
    PasswordRecovery(Session),
}

/// Helper function to get current timestamp in milliseconds
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time before Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms() {
        let ts = now_ms();
        assert!(ts > 0);
        // Should be reasonable timestamp (after year 2020)
        assert!(ts > 1_600_000_000_000);
    }

    #[test]
    fn test_task_serialization() {
        let task = Task {
            id: "t-1".to_string(),
            user_id: "u-1".to_string(),
            title: "Buy milk".to_string(),
            completed: false,
            created_at: 1000,
            updated_at: 1000,
        };

        let json = serde_json::to_string(&task).unwrap();
        // Wire names must stay aligned with the backend's columns
        assert!(json.contains("\"user_id\":\"u-1\""));
        assert!(json.contains("\"completed\":false"));

        let deserialized: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, task);
    }

    #[test]
    fn test_session_serialization() {
        let session = Session {
            user: User {
                id: "u-1".to_string(),
                email: "a@example.com".to_string(),
            },
        };

        let json = serde_json::to_string(&session).unwrap();
        let deserialized: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, session);
    }
}
