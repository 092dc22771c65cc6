// Hosted backend client: PostgREST-style rows plus the auth endpoints

use crate::api::{AuthApi, TasksApi};
use crate::error::{ApiError, AuthError};
use crate::models::{AuthEvent, NewTask, Profile, Session, Task, User};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 16;

/// Connection state shared by the tasks and auth halves of one hosted
/// collaborator: HTTP client, keys, and the bearer token of the active
/// session. Hosted sessions are not persisted across processes.
struct RemoteShared {
    client: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<ActiveSession>>,
    events: broadcast::Sender<AuthEvent>,
}

#[derive(Clone)]
struct ActiveSession {
    access_token: String,
    session: Session,
}

impl RemoteShared {
    fn rest_url(&self, relation: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, relation)
    }

    fn auth_url(&self, op: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, op)
    }

    /// Session token when signed in, anon key otherwise.
    fn bearer(&self) -> String {
        self.session
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.access_token.clone()))
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn with_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }

    fn set_session(&self, active: Option<ActiveSession>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = active;
        }
    }

    fn current(&self) -> Option<Session> {
        self.session
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.session.clone()))
    }

    fn emit(&self, event: AuthEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// [`TasksApi`] over the hosted collaborator's row endpoints.
#[derive(Clone)]
pub struct RemoteBackend {
    shared: Arc<RemoteShared>,
}

/// [`AuthApi`] over the hosted collaborator's auth endpoints.
#[derive(Clone)]
pub struct RemoteAuth {
    shared: Arc<RemoteShared>,
}

/// Build the two halves of one hosted connection. They share the bearer
/// token, so rows fetched after sign-in carry the user's authorization.
pub fn remote_pair(url: &str, anon_key: &str) -> (RemoteBackend, RemoteAuth) {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let shared = Arc::new(RemoteShared {
        client: Client::new(),
        base_url: url.trim_end_matches('/').to_string(),
        anon_key: anon_key.to_string(),
        session: RwLock::new(None),
        events,
    });
    (
        RemoteBackend {
            shared: shared.clone(),
        },
        RemoteAuth { shared },
    )
}

/// Task row as the collaborator serves it: timestamptz strings rather than
/// epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
struct TaskRow {
    id: String,
    user_id: String,
    title: String,
    completed: bool,
    created_at: String,
    updated_at: Option<String>,
}

/// ISO-8601 timestamptz to epoch milliseconds. Rows written before the
/// timezone migration lack an offset and are read as UTC.
fn parse_timestamp_ms(raw: &str) -> Result<i64, ApiError> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().timestamp_millis())
        .map_err(|e| ApiError::storage(format!("bad timestamp {:?}: {}", raw, e)))
}

fn task_from_row(row: TaskRow) -> Result<Task, ApiError> {
    let created_at = parse_timestamp_ms(&row.created_at)?;
    let updated_at = match row.updated_at.as_deref() {
        Some(raw) => parse_timestamp_ms(raw)?,
        None => created_at,
    };
    Ok(Task {
        id: row.id,
        user_id: row.user_id,
        title: row.title,
        completed: row.completed,
        created_at,
        updated_at,
    })
}

fn classify_rest_failure(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::NOT_FOUND => ApiError::not_found(body),
        StatusCode::CONFLICT => ApiError::conflict(body),
        s if s.is_server_error() => ApiError::unavailable(format!("{}: {}", s, body)),
        s => ApiError::storage(format!("{}: {}", s, body)),
    }
}

/// Error body shape varies across the collaborator's endpoints; collect the
/// candidates and take the first present.
#[derive(Debug, Default, Deserialize)]
struct AuthFailureBody {
    error_code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
}

fn classify_auth_failure(body: &str) -> AuthError {
    let parsed: AuthFailureBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error_code.unwrap_or_default();
    let msg = parsed
        .msg
        .or(parsed.message)
        .or(parsed.error_description)
        .unwrap_or_else(|| body.to_string());

    if msg.contains("Invalid login credentials") || code == "invalid_credentials" {
        AuthError::InvalidCredentials
    } else if msg.contains("Password should be at least 6 characters") || code == "weak_password" {
        AuthError::WeakPassword
    } else if msg.contains("already registered") || code == "user_already_exists" || code == "email_exists" {
        AuthError::EmailTaken
    } else if msg.contains("username") && (msg.contains("duplicate") || msg.contains("taken")) {
        AuthError::UsernameTaken
    } else if code == "otp_expired" || msg.contains("Token has expired") {
        AuthError::RecoveryExpired
    } else {
        AuthError::provider(msg)
    }
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    access_token: String,
    user: UserBody,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    id: String,
    email: String,
}

impl From<&SessionBody> for Session {
    fn from(body: &SessionBody) -> Self {
        Session {
            user: User {
                id: body.user.id.clone(),
                email: body.user.email.clone(),
            },
        }
    }
}

async fn check_rest(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, body = %body, "Row request refused");
    Err(classify_rest_failure(status, &body))
}

async fn check_auth(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, body = %body, "Auth request refused");
    Err(classify_auth_failure(&body))
}

#[async_trait]
impl TasksApi for RemoteBackend {
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, ApiError> {
        let owner = format!("eq.{}", user_id);
        let request = self
            .shared
            .with_headers(self.shared.client.get(self.shared.rest_url("tasks")))
            .query(&[
                ("select", "*"),
                ("user_id", owner.as_str()),
                ("order", "created_at.desc"),
            ]);
        let response = check_rest(request.send().await?).await?;
        let rows: Vec<TaskRow> = response.json().await?;

        debug!(user_id, count = rows.len(), "Listed remote tasks");
        rows.into_iter().map(task_from_row).collect()
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, ApiError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.rest_url("tasks")))
            .header("Prefer", "return=representation")
            .json(&json!({
                "user_id": new.user_id,
                "title": new.title,
                "completed": new.completed,
            }));
        let response = check_rest(request.send().await?).await?;

        let rows: Vec<TaskRow> = response.json().await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::storage("insert returned no row"))?;
        task_from_row(row)
    }

    async fn set_completed(&self, id: &str, completed: bool) -> Result<(), ApiError> {
        let request = self
            .shared
            .with_headers(self.shared.client.patch(self.shared.rest_url("tasks")))
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({ "completed": completed }));
        check_rest(request.send().await?).await?;
        Ok(())
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), ApiError> {
        let request = self
            .shared
            .with_headers(self.shared.client.patch(self.shared.rest_url("tasks")))
            .query(&[("id", format!("eq.{}", id))])
            .json(&json!({ "title": title }));
        check_rest(request.send().await?).await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
        let request = self
            .shared
            .with_headers(self.shared.client.delete(self.shared.rest_url("tasks")))
            .query(&[("id", format!("eq.{}", id))]);
        check_rest(request.send().await?).await?;
        Ok(())
    }

    async fn clear_tasks(&self, user_id: &str) -> Result<(), ApiError> {
        // Scoped by owner; row-level security refuses anything wider anyway
        let request = self
            .shared
            .with_headers(self.shared.client.delete(self.shared.rest_url("tasks")))
            .query(&[("user_id", format!("eq.{}", user_id))]);
        check_rest(request.send().await?).await?;

        debug!(user_id, "Cleared remote tasks");
        Ok(())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ApiError> {
        let row = format!("eq.{}", user_id);
        let request = self
            .shared
            .with_headers(self.shared.client.get(self.shared.rest_url("profiles")))
            .query(&[("select", "*"), ("id", row.as_str())]);
        let response = check_rest(request.send().await?).await?;

        let rows: Vec<Profile> = response.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn update_username(&self, user_id: &str, username: &str) -> Result<Profile, ApiError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.rest_url("profiles")))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&json!({ "id": user_id, "username": username }));
        let response = check_rest(request.send().await?).await?;

        let rows: Vec<Profile> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ApiError::storage("upsert returned no row"))
    }
}

#[async_trait]
impl AuthApi for RemoteAuth {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<Session, AuthError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.auth_url("signup")))
            .json(&json!({
                "email": email,
                "password": password,
                "data": { "username": username },
            }));
        let response = check_auth(request.send().await.map_err(ApiError::from)?).await?;

        let body: SessionBody = response.json().await.map_err(ApiError::from)?;
        let session = Session::from(&body);
        self.shared.set_session(Some(ActiveSession {
            access_token: body.access_token,
            session: session.clone(),
        }));

        debug!(user_id = %session.user.id, "Remote account created");
        self.shared
            .emit(AuthEvent::SessionChanged(Some(session.clone())));
        Ok(session)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.auth_url("token")))
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));
        let response = check_auth(request.send().await.map_err(ApiError::from)?).await?;

        let body: SessionBody = response.json().await.map_err(ApiError::from)?;
        let session = Session::from(&body);
        self.shared.set_session(Some(ActiveSession {
            access_token: body.access_token,
            session: session.clone(),
        }));

        debug!(user_id = %session.user.id, "Signed in remotely");
        self.shared
            .emit(AuthEvent::SessionChanged(Some(session.clone())));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.shared.current().is_none() {
            return Ok(());
        }

        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.auth_url("logout")));
        // Local state clears even when the revoke round-trip fails
        let result = request.send().await;
        self.shared.set_session(None);
        self.shared.emit(AuthEvent::SessionChanged(None));

        match result {
            Ok(response) => {
                check_auth(response).await?;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Sign-out revoke failed, session cleared locally");
                Ok(())
            }
        }
    }

    async fn request_password_reset(
        &self,
        email: &str,
        redirect_to: &str,
    ) -> Result<(), AuthError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.auth_url("recover")))
            .query(&[("redirect_to", redirect_to)])
            .json(&json!({ "email": email }));
        check_auth(request.send().await.map_err(ApiError::from)?).await?;
        Ok(())
    }

    async fn verify_recovery(&self, token: &str) -> Result<Session, AuthError> {
        let request = self
            .shared
            .with_headers(self.shared.client.post(self.shared.auth_url("verify")))
            .json(&json!({ "type": "recovery", "token_hash": token }));
        let response = check_auth(request.send().await.map_err(ApiError::from)?).await?;

        let body: SessionBody = response.json().await.map_err(ApiError::from)?;
        let session = Session::from(&body);
        self.shared.set_session(Some(ActiveSession {
            access_token: body.access_token,
            session: session.clone(),
        }));

        debug!(user_id = %session.user.id, "Recovery token exchanged remotely");
        self.shared
            .emit(AuthEvent::PasswordRecovery(session.clone()));
        Ok(session)
    }

    async fn update_password(&self, new_password: &str) -> Result<(), AuthError> {
        if self.shared.current().is_none() {
            return Err(AuthError::NotSignedIn);
        }

        let request = self
            .shared
            .with_headers(self.shared.client.put(self.shared.auth_url("user")))
            .json(&json!({ "password": new_password }));
        check_auth(request.send().await.map_err(ApiError::from)?).await?;
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.shared.current())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.shared.events.subscribe()
    }
}
