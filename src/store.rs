// Task store: optimistic mutations over a backend, with undoable deletes

use crate::api::TasksApi;
use crate::error::{MutationKind, StoreError};
use crate::models::{NewTask, Task};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How long a deleted task can still be brought back.
pub const DEFAULT_UNDO_GRACE: Duration = Duration::from_secs(5);

/// A task removed from the visible list, waiting out its grace window.
struct PendingDelete {
    task: Task,
    /// Where the task sat when the delete was requested; undo reinserts
    /// here, clamped to the current list end.
    index: usize,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct StoreState {
    /// Visible snapshot, newest first.
    tasks: Vec<Task>,
    /// Deletes counting down, keyed by task id. An id is never in both
    /// `tasks` and `pending`.
    pending: HashMap<String, PendingDelete>,
    loading: bool,
    last_error: Option<StoreError>,
}

struct StoreInner {
    api: Arc<dyn TasksApi>,
    user_id: String,
    grace: Duration,
    state: Mutex<StoreState>,
}

/// One user's task list with optimistic writes.
///
/// Mutations apply locally first (or on success, for inserts), then talk to
/// the backend; when the backend refuses, the store reloads authoritative
/// state and surfaces the failure through [`TaskStore::last_error`]. Deletes
/// are deferred: the task disappears immediately but the backend is only
/// told after the grace window, and [`TaskStore::undo`] cancels it.
///
/// Handles are cheap clones sharing one state; readers get owned snapshots,
/// never references into it. The backend lock is never held across a
/// backend call.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    pub fn new(api: Arc<dyn TasksApi>, user_id: impl Into<String>) -> Self {
        Self::with_grace(api, user_id, DEFAULT_UNDO_GRACE)
    }

    pub fn with_grace(api: Arc<dyn TasksApi>, user_id: impl Into<String>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                api,
                user_id: user_id.into(),
                grace,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn grace(&self) -> Duration {
        self.inner.grace
    }

    /// Owned snapshot of the visible list, newest first.
    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().await.tasks.clone()
    }

    pub async fn loading(&self) -> bool {
        self.inner.state.lock().await.loading
    }

    /// The most recent surfaced failure, cleared by the next operation.
    pub async fn last_error(&self) -> Option<StoreError> {
        self.inner.state.lock().await.last_error.clone()
    }

    /// How many deletes are currently counting down.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Replace the visible list with the backend's rows for this user.
    ///
    /// On failure the stale list stays available. Tasks still counting down
    /// are kept hidden even when the backend returns them.
    pub async fn load(&self) -> Result<(), StoreError> {
        {
            let mut st = self.inner.state.lock().await;
            st.last_error = None;
            st.loading = true;
        }

        let result = self.inner.api.list_tasks(&self.inner.user_id).await;

        let mut st = self.inner.state.lock().await;
        st.loading = false;
        match result {
            Ok(tasks) => {
                st.tasks = tasks
                    .into_iter()
                    .filter(|t| !st.pending.contains_key(&t.id))
                    .collect();
                debug!(user_id = %self.inner.user_id, count = st.tasks.len(), "Loaded tasks");
                Ok(())
            }
            Err(err) => {
                let error = StoreError::Load(err.to_string());
                warn!(detail = %err, "Load failed, keeping stale list");
                st.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Create a task from `title`. Whitespace-only titles are a quiet no-op
    /// (`Ok(None)`). The new task goes to the head of the list only after
    /// the backend stored it.
    pub async fn add(&self, title: &str) -> Result<Option<Task>, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        self.clear_error().await;

        let new = NewTask {
            user_id: self.inner.user_id.clone(),
            title: title.to_string(),
            completed: false,
        };

        match self.inner.api.insert_task(new).await {
            Ok(task) => {
                let mut st = self.inner.state.lock().await;
                st.tasks.insert(0, task.clone());
                debug!(id = %task.id, "Task created");
                Ok(Some(task))
            }
            Err(err) => {
                let error = StoreError::mutation(MutationKind::Create, &err);
                self.record_error(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Flip completion optimistically, judged from the caller's snapshot of
    /// the task. A backend refusal reloads authoritative state.
    pub async fn toggle(&self, task: &Task) -> Result<(), StoreError> {
        let target = !task.completed;
        {
            let mut st = self.inner.state.lock().await;
            st.last_error = None;
            for t in st.tasks.iter_mut().filter(|t| t.id == task.id) {
                t.completed = target;
            }
        }

        match self.inner.api.set_completed(&task.id, target).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let error = StoreError::mutation(MutationKind::Toggle, &err);
                self.reconcile(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Rename optimistically. Whitespace-only titles are a quiet no-op.
    pub async fn edit_title(&self, id: &str, new_title: &str) -> Result<(), StoreError> {
        let title = new_title.trim();
        if title.is_empty() {
            return Ok(());
        }

        {
            let mut st = self.inner.state.lock().await;
            st.last_error = None;
            for t in st.tasks.iter_mut().filter(|t| t.id == id) {
                t.title = title.to_string();
            }
        }

        match self.inner.api.set_title(id, title).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let error = StoreError::mutation(MutationKind::Rename, &err);
                self.reconcile(error.clone()).await;
                Err(error)
            }
        }
    }

    /// Hide the task and start its grace countdown. Returns `false` when
    /// the id is not visible (unknown, or already counting down).
    pub async fn request_delete(&self, id: &str) -> bool {
        let mut st = self.inner.state.lock().await;
        st.last_error = None;

        let Some(index) = st.tasks.iter().position(|t| t.id == id) else {
            return false;
        };
        let task = st.tasks.remove(index);
        let timer = self.spawn_countdown(id.to_string());
        st.pending.insert(id.to_string(), PendingDelete { task, index, timer });

        debug!(id, index, grace_ms = self.inner.grace.as_millis() as u64, "Delete scheduled");
        true
    }

    /// Bring back a task whose grace window has not elapsed. Returns
    /// `false` once the countdown already fired (or the id is unknown).
    pub async fn undo(&self, id: &str) -> bool {
        let mut st = self.inner.state.lock().await;
        let Some(pending) = st.pending.remove(id) else {
            return false;
        };
        pending.timer.abort();

        let index = pending.index.min(st.tasks.len());
        st.tasks.insert(index, pending.task);
        debug!(id, index, "Delete cancelled");
        true
    }

    /// Delete every task this user owns, backend first. Countdowns already
    /// in flight are left to fire; their backend deletes are no-ops.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.clear_error().await;

        match self.inner.api.clear_tasks(&self.inner.user_id).await {
            Ok(()) => {
                let mut st = self.inner.state.lock().await;
                st.tasks.clear();
                debug!(user_id = %self.inner.user_id, "Cleared all tasks");
                Ok(())
            }
            Err(err) => {
                let error = StoreError::mutation(MutationKind::Clear, &err);
                self.reconcile(error.clone()).await;
                Err(error)
            }
        }
    }

    fn spawn_countdown(&self, id: String) -> JoinHandle<()> {
        let store = self.clone();
        let grace = self.inner.grace;
        tokio::spawn(async move {
            sleep(grace).await;
            store.finish_delete(&id).await;
        })
    }

    async fn finish_delete(&self, id: &str) {
        // Claim the entry; an undo that won the race leaves nothing to do
        let claimed = self.inner.state.lock().await.pending.remove(id);
        if claimed.is_none() {
            return;
        }

        debug!(id, "Grace elapsed, deleting on backend");
        if let Err(err) = self.inner.api.delete_task(id).await {
            let error = StoreError::mutation(MutationKind::Delete, &err);
            warn!(id, detail = %err, "Deferred delete failed");
            self.reconcile(error).await;
        }
    }

    /// After a failed mutation: reload authoritative state, then surface
    /// the mutation's own error rather than any reload error.
    async fn reconcile(&self, error: StoreError) {
        warn!(error = %error, detail = %error.detail(), "Mutation failed, reloading");
        if let Err(load_err) = self.load().await {
            warn!(detail = %load_err.detail(), "Reload after failed mutation also failed");
        }
        self.record_error(error).await;
    }

    async fn clear_error(&self) {
        self.inner.state.lock().await.last_error = None;
    }

    async fn record_error(&self, error: StoreError) {
        self.inner.state.lock().await.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::models::Profile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory backend with per-operation failure switches.
    #[derive(Default)]
    struct MockApi {
        state: Mutex<MockState>,
        fail_list: AtomicBool,
        fail_insert: AtomicBool,
        fail_update: AtomicBool,
        fail_delete: AtomicBool,
        fail_clear: AtomicBool,
        deletes_issued: AtomicUsize,
    }

    #[derive(Default)]
    struct MockState {
        tasks: Vec<Task>,
        seq: i64,
    }

    impl MockApi {
        fn refuse(flag: &AtomicBool) -> Result<(), ApiError> {
            if flag.load(Ordering::SeqCst) {
                Err(ApiError::unavailable("injected failure"))
            } else {
                Ok(())
            }
        }

        async fn remote_tasks(&self) -> Vec<Task> {
            self.state.lock().await.tasks.clone()
        }
    }

    #[async_trait]
    impl TasksApi for MockApi {
        async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, ApiError> {
            Self::refuse(&self.fail_list)?;
            let st = self.state.lock().await;
            let mut tasks: Vec<Task> = st
                .tasks
                .iter()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect();
            tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(tasks)
        }

        async fn insert_task(&self, new: NewTask) -> Result<Task, ApiError> {
            Self::refuse(&self.fail_insert)?;
            let mut st = self.state.lock().await;
            st.seq += 1;
            let task = Task {
                id: format!("m{}", st.seq),
                user_id: new.user_id,
                title: new.title,
                completed: new.completed,
                created_at: 1_000 + st.seq,
                updated_at: 1_000 + st.seq,
            };
            st.tasks.push(task.clone());
            Ok(task)
        }

        async fn set_completed(&self, id: &str, completed: bool) -> Result<(), ApiError> {
            Self::refuse(&self.fail_update)?;
            let mut st = self.state.lock().await;
            for t in st.tasks.iter_mut().filter(|t| t.id == id) {
                t.completed = completed;
            }
            Ok(())
        }

        async fn set_title(&self, id: &str, title: &str) -> Result<(), ApiError> {
            Self::refuse(&self.fail_update)?;
            let mut st = self.state.lock().await;
            for t in st.tasks.iter_mut().filter(|t| t.id == id) {
                t.title = title.to_string();
            }
            Ok(())
        }

        async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
            Self::refuse(&self.fail_delete)?;
            self.deletes_issued.fetch_add(1, Ordering::SeqCst);
            let mut st = self.state.lock().await;
            st.tasks.retain(|t| t.id != id);
            Ok(())
        }

        async fn clear_tasks(&self, user_id: &str) -> Result<(), ApiError> {
            Self::refuse(&self.fail_clear)?;
            let mut st = self.state.lock().await;
            st.tasks.retain(|t| t.user_id != user_id);
            Ok(())
        }

        async fn fetch_profile(&self, _user_id: &str) -> Result<Option<Profile>, ApiError> {
            Ok(None)
        }

        async fn update_username(&self, user_id: &str, username: &str) -> Result<Profile, ApiError> {
            Ok(Profile {
                id: user_id.to_string(),
                username: Some(username.to_string()),
            })
        }
    }

    fn test_store() -> (TaskStore, Arc<MockApi>) {
        let api = Arc::new(MockApi::default());
        let store = TaskStore::new(api.clone(), "u1");
        (store, api)
    }

    /// Poll spawned countdown tasks: registers their sleeps on the paused
    /// clock, or runs them to completion once the clock has moved.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_add_prepends_open_task() {
        let (store, _api) = test_store();
        store.load().await.unwrap();

        store.add("first").await.unwrap();
        let added = store.add("  second  ").await.unwrap().unwrap();
        assert_eq!(added.title, "second");

        let tasks = store.tasks().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "second");
        assert!(!tasks[0].completed);
        assert_eq!(tasks[1].title, "first");
    }

    #[tokio::test]
    async fn test_add_blank_title_is_a_no_op() {
        let (store, api) = test_store();
        store.load().await.unwrap();

        let result = store.add("   ").await.unwrap();
        assert!(result.is_none());
        assert!(store.tasks().await.is_empty());
        assert!(api.remote_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_failure_leaves_list_unchanged() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("keep me").await.unwrap();

        api.fail_insert.store(true, Ordering::SeqCst);
        let err = store.add("doomed").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Mutation { action: MutationKind::Create, .. }
        ));

        let tasks = store.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "keep me");
        assert_eq!(store.last_error().await, Some(err));
    }

    #[tokio::test]
    async fn test_double_toggle_restores_original_flag() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("flip me").await.unwrap();

        let snapshot = store.tasks().await;
        store.toggle(&snapshot[0]).await.unwrap();
        assert!(store.tasks().await[0].completed);

        let snapshot = store.tasks().await;
        store.toggle(&snapshot[0]).await.unwrap();

        assert!(!store.tasks().await[0].completed);
        assert!(!api.remote_tasks().await[0].completed);
    }

    #[tokio::test]
    async fn test_toggle_failure_reloads_authoritative_state() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("stable").await.unwrap();

        api.fail_update.store(true, Ordering::SeqCst);
        let snapshot = store.tasks().await;
        let err = store.toggle(&snapshot[0]).await.unwrap_err();

        // Optimistic flip rolled back by the reload
        let tasks = store.tasks().await;
        assert!(!tasks[0].completed);
        assert!(!api.remote_tasks().await[0].completed);

        assert!(matches!(
            err,
            StoreError::Mutation { action: MutationKind::Toggle, .. }
        ));
        assert_eq!(store.last_error().await, Some(err));
    }

    #[tokio::test]
    async fn test_failed_edit_refetches_previous_title() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("original").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        api.fail_update.store(true, Ordering::SeqCst);
        let err = store.edit_title(&id, "changed").await.unwrap_err();

        let tasks = store.tasks().await;
        assert_eq!(tasks[0].title, "original");
        assert_eq!(err.to_string(), "Failed to update task.");
        assert_eq!(store.last_error().await, Some(err));
    }

    #[tokio::test]
    async fn test_edit_title_trims_and_persists() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("before").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        store.edit_title(&id, "  after  ").await.unwrap();
        assert_eq!(store.tasks().await[0].title, "after");
        assert_eq!(api.remote_tasks().await[0].title, "after");

        // Blank rename changes nothing
        store.edit_title(&id, "   ").await.unwrap();
        assert_eq!(store.tasks().await[0].title, "after");
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_right_after_delete_restores_identical_list() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("a").await.unwrap();
        store.add("b").await.unwrap();
        store.add("c").await.unwrap();

        let before = store.tasks().await;
        let victim = before[1].id.clone();

        assert!(store.request_delete(&victim).await);
        assert_eq!(store.tasks().await.len(), 2);
        assert_eq!(store.pending_count().await, 1);

        assert!(store.undo(&victim).await);
        assert_eq!(store.tasks().await, before);
        assert_eq!(store.pending_count().await, 0);

        // The backend never heard about it
        tokio::time::advance(DEFAULT_UNDO_GRACE * 2).await;
        settle().await;
        assert_eq!(api.deletes_issued.load(Ordering::SeqCst), 0);
        assert_eq!(api.remote_tasks().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_fires_after_grace() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("doomed").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        assert!(store.request_delete(&id).await);
        assert!(store.tasks().await.is_empty());
        // Let the countdown task register its sleep before moving the clock
        settle().await;

        // Not yet
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(api.deletes_issued.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(api.deletes_issued.load(Ordering::SeqCst), 1);
        assert!(api.remote_tasks().await.is_empty());
        assert_eq!(store.pending_count().await, 0);
        assert!(store.last_error().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_after_grace_is_too_late() {
        let (store, _api) = test_store();
        store.load().await.unwrap();
        store.add("gone").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        store.request_delete(&id).await;
        settle().await;
        tokio::time::advance(DEFAULT_UNDO_GRACE + Duration::from_millis(1)).await;
        settle().await;

        assert!(!store.undo(&id).await);
        assert!(store.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_delete_unknown_or_pending_id_is_refused() {
        let (store, _api) = test_store();
        store.load().await.unwrap();
        store.add("only").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        assert!(!store.request_delete("no-such-id").await);
        assert!(store.request_delete(&id).await);
        // Already counting down, no longer visible
        assert!(!store.request_delete(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_deletes_run_independently() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("a").await.unwrap();
        store.add("b").await.unwrap();
        let tasks = store.tasks().await; // [b, a]
        let (b, a) = (tasks[0].id.clone(), tasks[1].id.clone());

        store.request_delete(&a).await;
        store.request_delete(&b).await;
        assert_eq!(store.pending_count().await, 2);
        // Both countdowns must be polled onto the paused clock first
        settle().await;

        assert!(store.undo(&b).await);

        tokio::time::advance(DEFAULT_UNDO_GRACE * 2).await;
        settle().await;

        // Only "a" reached the backend
        assert_eq!(api.deletes_issued.load(Ordering::SeqCst), 1);
        let remaining = store.tasks().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_clamps_remembered_index() {
        let (store, _api) = test_store();
        store.load().await.unwrap();
        store.add("a").await.unwrap();
        store.add("b").await.unwrap();
        store.add("c").await.unwrap();
        let tasks = store.tasks().await; // [c, b, a]
        let b = tasks[1].id.clone();

        // Remembered index 1, then the list shrinks underneath it
        store.request_delete(&b).await;
        store.request_delete(&tasks[0].id).await;
        store.request_delete(&tasks[2].id).await;
        assert!(store.tasks().await.is_empty());

        assert!(store.undo(&b).await);
        let restored = store.tasks().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, b);
    }

    #[tokio::test]
    async fn test_clear_all_only_empties_this_user() {
        let api = Arc::new(MockApi::default());
        let mine = TaskStore::new(api.clone(), "u1");
        let theirs = TaskStore::new(api.clone(), "u2");

        mine.load().await.unwrap();
        theirs.load().await.unwrap();
        mine.add("mine 1").await.unwrap();
        mine.add("mine 2").await.unwrap();
        theirs.add("theirs").await.unwrap();

        mine.clear_all().await.unwrap();

        assert!(mine.tasks().await.is_empty());
        theirs.load().await.unwrap();
        let others = theirs.tasks().await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].title, "theirs");
    }

    #[tokio::test]
    async fn test_clear_all_failure_reloads() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("still here").await.unwrap();

        api.fail_clear.store(true, Ordering::SeqCst);
        let err = store.clear_all().await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Mutation { action: MutationKind::Clear, .. }
        ));
        assert_eq!(store.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_keeps_stale_list() {
        let (store, api) = test_store();
        store.load().await.unwrap();
        store.add("stale but visible").await.unwrap();

        api.fail_list.store(true, Ordering::SeqCst);
        let err = store.load().await.unwrap_err();

        assert!(matches!(err, StoreError::Load(_)));
        assert!(!store.loading().await);
        let tasks = store.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "stale but visible");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_pending_delete_hidden() {
        let (store, _api) = test_store();
        store.load().await.unwrap();
        store.add("hide me").await.unwrap();
        let id = store.tasks().await[0].id.clone();

        store.request_delete(&id).await;
        // Backend still has the row; a reload must not resurrect it
        store.load().await.unwrap();
        assert!(store.tasks().await.is_empty());
        assert_eq!(store.pending_count().await, 1);

        assert!(store.undo(&id).await);
        assert_eq!(store.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_next_operation_clears_last_error() {
        let (store, api) = test_store();
        store.load().await.unwrap();

        api.fail_insert.store(true, Ordering::SeqCst);
        store.add("nope").await.unwrap_err();
        assert!(store.last_error().await.is_some());

        api.fail_insert.store(false, Ordering::SeqCst);
        store.add("yep").await.unwrap();
        assert!(store.last_error().await.is_none());
    }
}
