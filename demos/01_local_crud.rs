//! Demo 01: Task CRUD against the local backend
//!
//! Walks through sign-up, adding tasks, toggling, renaming, filtering and
//! clearing, all against a temporary JSON file.
//!
//! Run with: cargo run --example 01_local_crud

use eyre::Result;
use std::sync::Arc;
use tasktrack::api::AuthApi;
use tasktrack::auth::LocalAuth;
use tasktrack::filter::{SortOrder, StatusFilter, count_tasks, visible_tasks};
use tasktrack::kv::KvFile;
use tasktrack::local::LocalBackend;
use tasktrack::store::TaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Everything lives in one temporary JSON file
    let temp_dir = tempfile::tempdir()?;
    let kv = KvFile::open(temp_dir.path().join("tasktrack.json"))?;

    println!("tasktrack Local CRUD Demo");
    println!("=========================\n");
    println!("Data file: {}\n", kv.path().display());

    // 1. Sign up
    println!("1. SIGN UP");
    let auth = LocalAuth::new(kv.clone());
    let session = auth.sign_up("demo@example.com", "hunter2!", "demo").await?;
    println!("   Signed in as {} ({})\n", session.user.email, session.user.id);

    // 2. Add tasks
    println!("2. ADD");
    let backend = Arc::new(LocalBackend::new(kv));
    let store = TaskStore::new(backend, session.user.id.clone());
    store.load().await?;

    for title in ["Buy milk", "Write demo", "Walk the dog"] {
        let task = store.add(title).await?.ok_or_else(|| eyre::eyre!("title was empty"))?;
        println!("   Added {} ({})", task.title, &task.id[..8]);
    }
    println!();

    // 3. Toggle the newest task
    println!("3. TOGGLE");
    let tasks = store.tasks().await;
    store.toggle(&tasks[0]).await?;
    println!("   Marked '{}' done\n", tasks[0].title);

    // 4. Rename the oldest task
    println!("4. EDIT");
    let oldest = store.tasks().await.last().cloned().ok_or_else(|| eyre::eyre!("no tasks loaded"))?;
    store.edit_title(&oldest.id, "Buy oat milk").await?;
    println!("   Renamed '{}' to 'Buy oat milk'\n", oldest.title);

    // 5. Filter and sort views
    println!("5. FILTER & SORT");
    let tasks = store.tasks().await;
    let counts = count_tasks(&tasks);
    println!("   {} total, {} open, {} done", counts.total, counts.open, counts.done);

    let open_az = visible_tasks(&tasks, StatusFilter::Open, SortOrder::TitleAsc);
    println!("   Open, A-Z:");
    for task in &open_az {
        println!("   - {}", task.title);
    }
    println!();

    // 6. Clear everything
    println!("6. CLEAR");
    store.clear_all().await?;
    println!("   Remaining tasks: {}\n", store.tasks().await.len());

    println!("Demo complete!");
    Ok(())
}
