// Session provider: current user, profile and recovery mode for the app

use crate::api::{AuthApi, TasksApi};
use crate::error::AuthError;
use crate::models::{AuthEvent, Profile, Session};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
struct SessionState {
    session: Option<Session>,
    profile: Option<Profile>,
    recovery_mode: bool,
}

struct ProviderInner {
    auth: Arc<dyn AuthApi>,
    tasks: Arc<dyn TasksApi>,
    state: Mutex<SessionState>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ProviderInner {
    fn drop(&mut self) {
        // Last handle gone: stop listening
        if let Ok(mut handles) = self.handles.try_lock() {
            for handle in handles.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Auth state for the running application.
///
/// Subscribes to the auth backend's event stream for its whole lifetime and
/// keeps `{ session, profile, recovery_mode }` current; the tasks backend is
/// only consulted for the profile row. Handles are cheap clones; [`close`]
/// (or dropping the last handle) tears the listener down.
///
/// [`close`]: SessionProvider::close
#[derive(Clone)]
pub struct SessionProvider {
    inner: Arc<ProviderInner>,
}

impl SessionProvider {
    /// Subscribe to auth events, then resolve the initial session in the
    /// background. [`wait_ready`] blocks until that resolution lands.
    ///
    /// [`wait_ready`]: SessionProvider::wait_ready
    pub fn start(auth: Arc<dyn AuthApi>, tasks: Arc<dyn TasksApi>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);

        // Subscribe before resolving so no transition lands in the gap
        let events = auth.subscribe();

        let provider = Self {
            inner: Arc::new(ProviderInner {
                auth,
                tasks,
                state: Mutex::new(SessionState::default()),
                ready_tx,
                ready_rx,
                handles: Mutex::new(Vec::new()),
            }),
        };

        // The listener only borrows the state weakly, so dropping the last
        // outside handle really does tear everything down
        let listener = {
            let inner = Arc::downgrade(&provider.inner);
            tokio::spawn(async move { listen(inner, events).await })
        };
        let resolver = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.resolve_initial().await })
        };

        // No other holder can exist yet
        if let Ok(mut handles) = provider.inner.handles.try_lock() {
            handles.push(listener);
            handles.push(resolver);
        }

        provider
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.state.lock().await.session.clone()
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.inner.state.lock().await.profile.clone()
    }

    /// True between a recovery-link exchange and the next sign-in/sign-out;
    /// the view branches to the password-reset form while set.
    pub async fn recovery_mode(&self) -> bool {
        self.inner.state.lock().await.recovery_mode
    }

    /// Resolves once the initial session fetch has finished.
    pub async fn wait_ready(&self) {
        let mut rx = self.inner.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Sign out on the backend and clear local state immediately, without
    /// waiting for the event round-trip.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.auth.sign_out().await?;
        *self.inner.state.lock().await = SessionState::default();
        Ok(())
    }

    /// Re-fetch the signed-in user's profile row; used after a username
    /// edit. A fetch failure keeps the previous profile.
    pub async fn refresh_profile(&self) {
        let Some(user_id) = self.session().await.map(|s| s.user.id) else {
            return;
        };
        match self.inner.tasks.fetch_profile(&user_id).await {
            Ok(profile) => {
                self.inner.state.lock().await.profile = profile;
            }
            Err(err) => warn!(error = %err, "Failed to load profile"),
        }
    }

    /// Stop the listener. Events after this are ignored.
    pub async fn close(&self) {
        for handle in self.inner.handles.lock().await.drain(..) {
            handle.abort();
        }
    }

    async fn resolve_initial(&self) {
        match self.inner.auth.current_session().await {
            Ok(Some(session)) => {
                debug!(user_id = %session.user.id, "Resumed session");
                self.inner.state.lock().await.session = Some(session);
                self.refresh_profile().await;
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Failed to resolve initial session"),
        }
        let _ = self.inner.ready_tx.send(true);
    }

    async fn apply(&self, event: AuthEvent) {
        match event {
            AuthEvent::SessionChanged(Some(session)) => {
                debug!(user_id = %session.user.id, "Session changed");
                {
                    let mut state = self.inner.state.lock().await;
                    state.session = Some(session);
                    state.recovery_mode = false;
                }
                self.refresh_profile().await;
            }
            AuthEvent::SessionChanged(None) => {
                debug!("Session ended");
                *self.inner.state.lock().await = SessionState::default();
            }
            AuthEvent::PasswordRecovery(session) => {
                debug!(user_id = %session.user.id, "Recovery mode entered");
                let mut state = self.inner.state.lock().await;
                state.session = Some(session);
                state.recovery_mode = true;
            }
        }
    }
}

/// Event loop of the background listener. Holds the provider state only
/// weakly between events; once the last handle is gone the upgrade fails
/// and the loop exits.
async fn listen(inner: Weak<ProviderInner>, mut events: broadcast::Receiver<AuthEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                SessionProvider { inner }.apply(event).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Auth event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use crate::kv::KvFile;
    use crate::local::LocalBackend;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn test_backends() -> (Arc<LocalAuth>, Arc<LocalBackend>, TempDir) {
        let temp = TempDir::new().unwrap();
        let kv = KvFile::open(temp.path().join("tasktrack.json")).unwrap();
        (
            Arc::new(LocalAuth::new(kv.clone())),
            Arc::new(LocalBackend::new(kv)),
            temp,
        )
    }

    /// Poll until `check` passes; the listener runs on its own task.
    macro_rules! eventually {
        ($check:expr, $what:literal) => {{
            let mut ok = false;
            for _ in 0..200 {
                if $check {
                    ok = true;
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
            assert!(ok, concat!("timed out waiting for ", $what));
        }};
    }

    #[tokio::test]
    async fn test_starts_signed_out() {
        let (auth, tasks, _temp) = test_backends();
        let provider = SessionProvider::start(auth, tasks);

        provider.wait_ready().await;
        assert!(provider.session().await.is_none());
        assert!(provider.profile().await.is_none());
        assert!(!provider.recovery_mode().await);
    }

    #[tokio::test]
    async fn test_resumes_persisted_session_with_profile() {
        let (auth, tasks, _temp) = test_backends();
        let session = auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();

        // Fresh provider, as on app start
        let provider = SessionProvider::start(auth, tasks);
        provider.wait_ready().await;

        assert_eq!(provider.session().await.unwrap().user.id, session.user.id);
        let profile = provider.profile().await.unwrap();
        assert_eq!(profile.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_sign_in_event_updates_state() {
        let (auth, tasks, _temp) = test_backends();
        let provider = SessionProvider::start(auth.clone(), tasks);
        provider.wait_ready().await;
        assert!(provider.session().await.is_none());

        auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();

        eventually!(provider.session().await.is_some(), "session");
        eventually!(provider.profile().await.is_some(), "profile");
    }

    #[tokio::test]
    async fn test_recovery_event_sets_recovery_mode() {
        let (auth, tasks, _temp) = test_backends();
        auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();
        auth.sign_out().await.unwrap();
        auth.request_password_reset("a@example.com", "app://reset").await.unwrap();
        let token = auth.recovery_token_for("a@example.com").unwrap().unwrap();

        let provider = SessionProvider::start(auth.clone(), tasks);
        provider.wait_ready().await;

        auth.verify_recovery(&token).await.unwrap();
        eventually!(provider.recovery_mode().await, "recovery mode");
        assert!(provider.session().await.is_some());

        // Leaving recovery: sign out clears the flag
        auth.sign_out().await.unwrap();
        eventually!(!provider.recovery_mode().await, "recovery mode cleared");
    }

    #[tokio::test]
    async fn test_sign_out_clears_state_immediately() {
        let (auth, tasks, _temp) = test_backends();
        auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();

        let provider = SessionProvider::start(auth, tasks);
        provider.wait_ready().await;
        assert!(provider.session().await.is_some());

        provider.sign_out().await.unwrap();
        assert!(provider.session().await.is_none());
        assert!(provider.profile().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_tears_down() {
        let (auth, tasks, _temp) = test_backends();
        let provider = SessionProvider::start(auth.clone(), tasks);
        provider.wait_ready().await;

        let state = Arc::downgrade(&provider.inner);
        drop(provider);

        // The listener holds no strong reference, so the state is freed
        // without an explicit close()
        eventually!(state.upgrade().is_none(), "state to drop");

        // Later events find nothing to update and the loop exits
        auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(state.strong_count(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_listening() {
        let (auth, tasks, _temp) = test_backends();
        let provider = SessionProvider::start(auth.clone(), tasks);
        provider.wait_ready().await;

        provider.close().await;
        auth.sign_up("a@example.com", "secret1", "alice").await.unwrap();

        // The event goes nowhere
        sleep(Duration::from_millis(50)).await;
        assert!(provider.session().await.is_none());
    }
}
