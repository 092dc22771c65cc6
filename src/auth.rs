// Local auth backend: accounts, sessions and recovery tokens in the kv file

use crate::api::AuthApi;
use crate::error::AuthError;
use crate::kv::KvFile;
use crate::local::PROFILES_KEY;
use crate::models::{AuthEvent, Profile, Session, User, now_ms};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Storage key for the auth state.
pub const AUTH_KEY: &str = "auth_v1";

const MIN_PASSWORD_LEN: usize = 6;
const RECOVERY_TOKEN_TTL_MS: i64 = 60 * 60 * 1000;
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountRecord {
    id: String,
    email: String,
    salt: String,
    password_digest: String,
    created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecoveryRecord {
    token: String,
    user_id: String,
    expires_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AuthState {
    accounts: Vec<AccountRecord>,
    current_user_id: Option<String>,
    recovery_tokens: Vec<RecoveryRecord>,
}

impl AuthState {
    fn account_by_email(&self, email: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.email == email)
    }

    fn account_by_id(&self, id: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.id == id)
    }

    fn drop_expired_tokens(&mut self) {
        let now = now_ms();
        self.recovery_tokens.retain(|t| t.expires_at > now);
    }
}

/// File-backed [`AuthApi`] standing in for the hosted provider.
///
/// Credentials are salted SHA-256 digests; this is offline-mode state for a
/// single machine, not a password vault. Sessions persist across processes
/// through the kv file, and recovery tokens replace the emailed reset link.
#[derive(Debug, Clone)]
pub struct LocalAuth {
    kv: KvFile,
    events: broadcast::Sender<AuthEvent>,
}

impl LocalAuth {
    pub fn new(kv: KvFile) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { kv, events }
    }

    /// The newest outstanding recovery token for `email`, if any. In local
    /// mode this is what the emailed link would have carried.
    pub fn recovery_token_for(&self, email: &str) -> Result<Option<String>, AuthError> {
        let email = normalize_email(email);
        let state: AuthState = self.kv.get(AUTH_KEY)?.unwrap_or_default();
        let Some(account) = state.account_by_email(&email) else {
            return Ok(None);
        };

        let now = now_ms();
        Ok(state
            .recovery_tokens
            .iter()
            .filter(|t| t.user_id == account.id && t.expires_at > now)
            .max_by_key(|t| t.expires_at)
            .map(|t| t.token.clone()))
    }

    fn emit(&self, event: AuthEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn session_for(account: &AccountRecord) -> Session {
        Session {
            user: User {
                id: account.id.clone(),
                email: account.email.clone(),
            },
        }
    }
}

#[async_trait]
impl AuthApi for LocalAuth {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        let username = username.trim().to_string();

        if !valid_email(&email) {
            return Err(AuthError::provider(format!(
                "Unable to validate email address: {}",
                email
            )));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        if !username.is_empty() {
            let profiles: BTreeMap<String, Profile> =
                self.kv.get(PROFILES_KEY)?.unwrap_or_default();
            if profiles
                .values()
                .any(|p| p.username.as_deref() == Some(username.as_str()))
            {
                return Err(AuthError::UsernameTaken);
            }
        }

        let salt = uuid::Uuid::now_v7().to_string();
        let account = AccountRecord {
            id: uuid::Uuid::now_v7().to_string(),
            email: email.clone(),
            password_digest: password_digest(&salt, password),
            salt,
            created_at: now_ms(),
        };

        let stored = account.clone();
        self.kv.update(AUTH_KEY, AuthState::default, move |state| {
            if state.account_by_email(&stored.email).is_some() {
                return Err(crate::error::ApiError::conflict("email already registered"));
            }
            state.current_user_id = Some(stored.id.clone());
            state.accounts.push(stored);
            Ok(())
        })
        .map_err(|err| match err {
            crate::error::ApiError::Conflict(_) => AuthError::EmailTaken,
            other => other.into(),
        })?;

        // Sign-up metadata seeds the profile row
        if !username.is_empty() {
            self.kv.update(
                PROFILES_KEY,
                BTreeMap::<String, Profile>::new,
                |profiles| {
                    profiles.insert(
                        account.id.clone(),
                        Profile {
                            id: account.id.clone(),
                            username: Some(username.clone()),
                        },
                    );
                    Ok(())
                },
            )?;
        }

        let session = Self::session_for(&account);
        info!(user_id = %account.id, "Account created");
        self.emit(AuthEvent::SessionChanged(Some(session.clone())));
        Ok(session)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email);

        let session = self.kv.update(AUTH_KEY, AuthState::default, |state| {
            // Unknown email and wrong password answer identically
            let Some(account) = state.account_by_email(&email) else {
                return Ok(None);
            };
            if account.password_digest != password_digest(&account.salt, password) {
                return Ok(None);
            }
            let session = Self::session_for(account);
            state.current_user_id = Some(session.user.id.clone());
            Ok(Some(session))
        })?;

        match session {
            Some(session) => {
                debug!(user_id = %session.user.id, "Signed in");
                self.emit(AuthEvent::SessionChanged(Some(session.clone())));
                Ok(session)
            }
            None => Err(AuthError::InvalidCredentials),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.kv.update(AUTH_KEY, AuthState::default, |state| {
            state.current_user_id = None;
            Ok(())
        })?;

        debug!("Signed out");
        self.emit(AuthEvent::SessionChanged(None));
        Ok(())
    }

    async fn request_password_reset(
        &self,
        email: &str,
        _redirect_to: &str,
    ) -> Result<(), AuthError> {
        let email = normalize_email(email);

        self.kv.update(AUTH_KEY, AuthState::default, |state| {
            state.drop_expired_tokens();

            // Unknown emails succeed silently so callers cannot probe accounts
            let Some(account) = state.account_by_email(&email) else {
                return Ok(());
            };

            let record = RecoveryRecord {
                token: uuid::Uuid::now_v7().to_string(),
                user_id: account.id.clone(),
                expires_at: now_ms() + RECOVERY_TOKEN_TTL_MS,
            };
            state.recovery_tokens.push(record);
            Ok(())
        })?;

        info!("Password reset requested");
        Ok(())
    }

    async fn verify_recovery(&self, token: &str) -> Result<Session, AuthError> {
        let token = token.trim().to_string();

        let session = self.kv.update(AUTH_KEY, AuthState::default, |state| {
            state.drop_expired_tokens();

            let Some(pos) = state.recovery_tokens.iter().position(|t| t.token == token) else {
                return Ok(None);
            };
            // Single use
            let record = state.recovery_tokens.remove(pos);
            let Some(account) = state.account_by_id(&record.user_id) else {
                return Ok(None);
            };
            let session = Self::session_for(account);
            state.current_user_id = Some(session.user.id.clone());
            Ok(Some(session))
        })?;

        match session {
            Some(session) => {
                info!(user_id = %session.user.id, "Recovery token exchanged");
                self.emit(AuthEvent::PasswordRecovery(session.clone()));
                Ok(session)
            }
            None => Err(AuthError::RecoveryExpired),
        }
    }

    async fn update_password(&self, new_password: &str) -> Result<(), AuthError> {
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let new_password = new_password.to_string();
        let updated = self.kv.update(AUTH_KEY, AuthState::default, |state| {
            let Some(user_id) = state.current_user_id.clone() else {
                return Ok(false);
            };
            for account in state.accounts.iter_mut().filter(|a| a.id == user_id) {
                account.salt = uuid::Uuid::now_v7().to_string();
                account.password_digest = password_digest(&account.salt, &new_password);
            }
            Ok(true)
        })?;

        if !updated {
            return Err(AuthError::NotSignedIn);
        }
        info!("Password updated");
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let state: AuthState = self.kv.get(AUTH_KEY)?.unwrap_or_default();
        let session = state
            .current_user_id
            .as_deref()
            .and_then(|id| state.account_by_id(id))
            .map(Self::session_for);
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

fn password_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
