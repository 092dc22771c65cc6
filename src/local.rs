// Local tasks backend over the kv file (offline mode)

use crate::api::TasksApi;
use crate::error::ApiError;
use crate::kv::KvFile;
use crate::models::{NewTask, Profile, Task, now_ms};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Storage key for the task rows.
pub const TASKS_KEY: &str = "tasks_v1";
/// Storage key for the profile rows, an object keyed by user id.
pub const PROFILES_KEY: &str = "profiles_v1";

/// File-backed [`TasksApi`] with the same visible behavior as the hosted
/// backend: newest-first listing, zero-row updates count as success,
/// deletes are idempotent.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    kv: KvFile,
}

impl LocalBackend {
    pub fn new(kv: KvFile) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl TasksApi for LocalBackend {
    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, ApiError> {
        let all: Vec<Task> = self.kv.get(TASKS_KEY)?.unwrap_or_default();
        let mut tasks: Vec<Task> = all.into_iter().filter(|t| t.user_id == user_id).collect();
        // Stored order is already newest-first (inserts go to the head);
        // the stable sort keeps insertion order for equal timestamps.
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        debug!(user_id, count = tasks.len(), "Listed local tasks");
        Ok(tasks)
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, ApiError> {
        let task = Task {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: new.user_id,
            title: new.title,
            completed: new.completed,
            created_at: now_ms(),
            updated_at: now_ms(),
        };

        let stored = task.clone();
        self.kv.update(TASKS_KEY, Vec::<Task>::new, move |tasks| {
            tasks.insert(0, stored);
            Ok(())
        })?;

        debug!(id = %task.id, user_id = %task.user_id, "Inserted local task");
        Ok(task)
    }

    async fn set_completed(&self, id: &str, completed: bool) -> Result<(), ApiError> {
        self.kv.update(TASKS_KEY, Vec::<Task>::new, |tasks| {
            for task in tasks.iter_mut().filter(|t| t.id == id) {
                task.completed = completed;
                task.updated_at = now_ms();
            }
            Ok(())
        })
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<(), ApiError> {
        self.kv.update(TASKS_KEY, Vec::<Task>::new, |tasks| {
            for task in tasks.iter_mut().filter(|t| t.id == id) {
                task.title = title.to_string();
                task.updated_at = now_ms();
            }
            Ok(())
        })
    }

    async fn delete_task(&self, id: &str) -> Result<(), ApiError> {
        self.kv.update(TASKS_KEY, Vec::<Task>::new, |tasks| {
            tasks.retain(|t| t.id != id);
            Ok(())
        })
    }

    async fn clear_tasks(&self, user_id: &str) -> Result<(), ApiError> {
        self.kv.update(TASKS_KEY, Vec::<Task>::new, |tasks| {
            let before = tasks.len();
            tasks.retain(|t| t.user_id != user_id);
            debug!(user_id, removed = before - tasks.len(), "Cleared local tasks");
            Ok(())
        })
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ApiError> {
        let profiles: BTreeMap<String, Profile> = self.kv.get(PROFILES_KEY)?.unwrap_or_default();
        Ok(profiles.get(user_id).cloned())
    }

    async fn update_username(&self, user_id: &str, username: &str) -> Result<Profile, ApiError> {
        let user_id = user_id.to_string();
        let username = username.to_string();

        self.kv.update(
            PROFILES_KEY,
            BTreeMap::<String, Profile>::new,
            move |profiles| {
                let taken = profiles
                    .iter()
                    .any(|(id, p)| *id != user_id && p.username.as_deref() == Some(&username));
                if taken {
                    return Err(ApiError::conflict(format!(
                        "username \"{}\" is already taken",
                        username
                    )));
                }

                let profile = Profile {
                    id: user_id.clone(),
                    username: Some(username.clone()),
                };
                profiles.insert(user_id.clone(), profile.clone());
                Ok(profile)
            },
        )
    }
}
