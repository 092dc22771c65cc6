//! Demo 02: Deferred delete with undo
//!
//! Shows the grace window: a deleted task disappears immediately but the
//! backend is only told after the countdown, and an undo inside the window
//! cancels the delete entirely. Uses a short grace so the demo runs fast.
//!
//! Run with: cargo run --example 02_undo_delete

use eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tasktrack::api::{AuthApi, TasksApi};
use tasktrack::auth::LocalAuth;
use tasktrack::kv::KvFile;
use tasktrack::local::LocalBackend;
use tasktrack::store::TaskStore;

const DEMO_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let kv = KvFile::open(temp_dir.path().join("tasktrack.json"))?;

    println!("tasktrack Undo Delete Demo");
    println!("==========================\n");

    let auth = LocalAuth::new(kv.clone());
    let session = auth.sign_up("demo@example.com", "hunter2!", "demo").await?;
    let backend = Arc::new(LocalBackend::new(kv));
    let store = TaskStore::with_grace(backend.clone(), session.user.id.clone(), DEMO_GRACE);
    store.load().await?;

    let keep = store.add("Keep me").await?.ok_or_else(|| eyre::eyre!("title was empty"))?;
    let doomed = store.add("Delete me").await?.ok_or_else(|| eyre::eyre!("title was empty"))?;
    println!("Starting with {} tasks\n", store.tasks().await.len());

    // 1. Delete, then undo inside the window
    println!("1. DELETE + UNDO");
    store.request_delete(&keep.id).await;
    println!("   '{}' hidden, countdown running...", keep.title);
    println!("   Visible tasks: {}", store.tasks().await.len());

    let restored = store.undo(&keep.id).await;
    println!("   Undo succeeded: {}", restored);
    println!("   Visible tasks: {}\n", store.tasks().await.len());

    // 2. Delete and let the window elapse
    println!("2. DELETE, NO UNDO");
    store.request_delete(&doomed.id).await;
    println!("   '{}' hidden, waiting out the grace window...", doomed.title);
    tokio::time::sleep(DEMO_GRACE * 2).await;

    let too_late = store.undo(&doomed.id).await;
    println!("   Undo after the window: {}", too_late);

    // The backend was only told once the countdown fired
    let remote = backend.list_tasks(&session.user.id).await?;
    println!("   Backend rows: {}", remote.len());
    for task in &remote {
        println!("   - {}", task.title);
    }
    println!();

    println!("Demo complete!");
    Ok(())
}
