use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Result, bail, eyre};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tasktrack::api::{AuthApi, TasksApi};
use tasktrack::auth::LocalAuth;
use tasktrack::config::{BackendKind, Config};
use tasktrack::error::{ApiError, AuthError};
use tasktrack::filter::{SortOrder, StatusFilter, count_tasks, visible_tasks};
use tasktrack::kv::KvFile;
use tasktrack::local::LocalBackend;
use tasktrack::models::Task;
use tasktrack::remote::remote_pair;
use tasktrack::store::TaskStore;
use tokio::io::AsyncBufReadExt;

#[derive(Parser)]
#[command(name = "tasktrack")]
#[command(about = "Personal task tracker with optimistic sync and undoable deletes")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Path to the config file (default: platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        confirm: String,
    },

    /// Sign in
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },

    /// Sign out
    Logout,

    /// Show the signed-in user
    Whoami,

    /// Profile settings
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Request a password-reset link
    ResetRequest {
        #[arg(long)]
        email: String,
    },

    /// Complete a password reset with the recovery token
    Recover {
        #[arg(long)]
        token: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        confirm: String,
    },

    /// Show tasks
    List {
        #[arg(long, value_enum, default_value_t)]
        status: StatusFilter,
        #[arg(long, value_enum, default_value_t)]
        sort: SortOrder,
    },

    /// Add a task
    Add {
        #[arg(required = true)]
        title: Vec<String>,
    },

    /// Toggle a task's completion by id prefix
    Done { id: String },

    /// Rename a task
    Edit {
        id: String,
        #[arg(required = true)]
        title: Vec<String>,
    },

    /// Delete a task, with a short window to undo
    Rm { id: String },

    /// Delete every task you own
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Set your username
    SetUsername { name: String },
}

/// The configured backend pair. Local mode keeps a concrete auth handle so
/// the CLI can surface the mock recovery token.
struct Backends {
    tasks: Arc<dyn TasksApi>,
    auth: Arc<dyn AuthApi>,
    local_auth: Option<LocalAuth>,
}

fn build_backends(config: &Config) -> Result<Backends> {
    match config.backend {
        BackendKind::Local => {
            let kv = KvFile::open(config.kv_path())?;
            let auth = LocalAuth::new(kv.clone());
            Ok(Backends {
                tasks: Arc::new(LocalBackend::new(kv)),
                auth: Arc::new(auth.clone()),
                local_auth: Some(auth),
            })
        }
        BackendKind::Remote => {
            let remote = config.remote_settings()?;
            let (backend, auth) = remote_pair(&remote.url, &remote.anon_key);
            Ok(Backends {
                tasks: Arc::new(backend),
                auth: Arc::new(auth),
                local_auth: None,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let backends = build_backends(&config)?;

    match cli.command {
        Commands::Signup {
            email,
            username,
            password,
            confirm,
        } => signup(&backends, &email, &username, &password, &confirm).await,
        Commands::Login { email, password } => login(&backends, &email, &password).await,
        Commands::Logout => {
            backends.auth.sign_out().await?;
            println!("Signed out.");
            Ok(())
        }
        Commands::Whoami => whoami(&backends).await,
        Commands::Profile {
            command: ProfileCommands::SetUsername { name },
        } => set_username(&backends, &name).await,
        Commands::ResetRequest { email } => reset_request(&backends, &email).await,
        Commands::Recover {
            token,
            password,
            confirm,
        } => recover(&backends, &token, &password, &confirm).await,
        Commands::List { status, sort } => list(&backends, status, sort).await,
        Commands::Add { title } => add(&backends, &title.join(" ")).await,
        Commands::Done { id } => done(&backends, &id).await,
        Commands::Edit { id, title } => edit(&backends, &id, &title.join(" ")).await,
        Commands::Rm { id } => rm(&backends, &id).await,
        Commands::Clear { yes } => clear(&backends, yes).await,
    }
}

async fn signup(
    backends: &Backends,
    email: &str,
    username: &str,
    password: &str,
    confirm: &str,
) -> Result<()> {
    // Same checks the sign-up form runs before calling the backend
    if !email.contains('@') {
        bail!("Please enter a valid email address.");
    }
    if password.len() < 6 {
        bail!("Password should be at least 6 characters.");
    }
    if password != confirm {
        bail!("Passwords do not match.");
    }

    let session = backends.auth.sign_up(email, password, username).await?;
    println!(
        "{} Signed in as {}.",
        "Account created.".green(),
        session.user.email.bold()
    );
    Ok(())
}

async fn login(backends: &Backends, email: &str, password: &str) -> Result<()> {
    match backends.auth.sign_in(email, password).await {
        Ok(session) => {
            println!("Signed in as {}.", session.user.email.bold());
            Ok(())
        }
        Err(AuthError::InvalidCredentials) => bail!("Incorrect email or password"),
        Err(err) => Err(err.into()),
    }
}

async fn whoami(backends: &Backends) -> Result<()> {
    let Some(session) = backends.auth.current_session().await? else {
        println!("Not signed in.");
        return Ok(());
    };

    let profile = backends.tasks.fetch_profile(&session.user.id).await?;
    match profile.and_then(|p| p.username) {
        Some(username) => println!("{} ({})", username.bold(), session.user.email),
        None => println!("{}", session.user.email.bold()),
    }
    Ok(())
}

async fn set_username(backends: &Backends, name: &str) -> Result<()> {
    let session = require_session(backends).await?;

    match backends.tasks.update_username(&session.user.id, name).await {
        Ok(profile) => {
            println!(
                "Username set to {}.",
                profile.username.unwrap_or_default().bold()
            );
            Ok(())
        }
        Err(ApiError::Conflict(_)) => bail!("That username is already taken"),
        Err(err) => Err(err.into()),
    }
}

async fn reset_request(backends: &Backends, email: &str) -> Result<()> {
    backends
        .auth
        .request_password_reset(email, "tasktrack://reset")
        .await?;
    println!("If an account exists for {}, a reset link has been sent.", email);

    // No email leaves this machine in local mode; print the token instead
    if let Some(local) = &backends.local_auth {
        if let Some(token) = local.recovery_token_for(email)? {
            println!("Recovery token (local mode): {}", token.yellow());
        }
    }
    Ok(())
}

async fn recover(backends: &Backends, token: &str, password: &str, confirm: &str) -> Result<()> {
    if password.len() < 6 {
        bail!("Password should be at least 6 characters.");
    }
    if password != confirm {
        bail!("Passwords do not match.");
    }

    backends.auth.verify_recovery(token).await?;
    backends.auth.update_password(password).await?;
    backends.auth.sign_out().await?;

    println!("{}", "Password updated. Please log in.".green());
    Ok(())
}

async fn list(backends: &Backends, status: StatusFilter, sort: SortOrder) -> Result<()> {
    let store = open_store(backends).await?;
    let tasks = store.tasks().await;

    if tasks.is_empty() {
        println!("No tasks yet. Add one with `tasktrack add <title>`.");
        return Ok(());
    }

    let visible = visible_tasks(&tasks, status, sort);
    if visible.is_empty() {
        println!("No {} tasks.", status);
    }
    for task in &visible {
        let mark = if task.completed {
            "[x]".green()
        } else {
            "[ ]".normal()
        };
        let title = if task.completed {
            task.title.dimmed().strikethrough()
        } else {
            task.title.normal()
        };
        println!("{} {}  {}", mark, short_id(&task.id).dimmed(), title);
    }

    let counts = count_tasks(&tasks);
    println!(
        "{}",
        format!(
            "{} total, {} open, {} done",
            counts.total, counts.open, counts.done
        )
        .dimmed()
    );
    Ok(())
}

async fn add(backends: &Backends, title: &str) -> Result<()> {
    let store = open_store(backends).await?;
    match store.add(title).await? {
        Some(task) => {
            println!("{} {}", "Added".green(), task.title.bold());
            Ok(())
        }
        None => bail!("Title cannot be empty."),
    }
}

async fn done(backends: &Backends, id: &str) -> Result<()> {
    let store = open_store(backends).await?;
    let tasks = store.tasks().await;
    let task = resolve_id(&tasks, id)?.clone();

    store.toggle(&task).await?;
    let state = if task.completed { "open" } else { "done" };
    println!("Marked {} as {}.", task.title.bold(), state);
    Ok(())
}

async fn edit(backends: &Backends, id: &str, title: &str) -> Result<()> {
    if title.trim().is_empty() {
        bail!("Title cannot be empty.");
    }

    let store = open_store(backends).await?;
    let tasks = store.tasks().await;
    let task = resolve_id(&tasks, id)?.clone();

    store.edit_title(&task.id, title).await?;
    println!("Renamed {} to {}.", task.title, title.trim().bold());
    Ok(())
}

async fn rm(backends: &Backends, id: &str) -> Result<()> {
    let store = open_store(backends).await?;
    let tasks = store.tasks().await;
    let task = resolve_id(&tasks, id)?.clone();

    store.request_delete(&task.id).await;
    let grace = store.grace();
    println!(
        "Deleted {}. Press Enter within {}s to undo.",
        task.title.bold(),
        grace.as_secs()
    );

    let undone = tokio::select! {
        _ = tokio::time::sleep(grace) => false,
        _ = wait_for_enter() => store.undo(&task.id).await,
    };

    if undone {
        println!("{}", "Restored.".green());
        return Ok(());
    }

    // Hold the process open until the countdown's backend call lands
    while store.pending_count().await > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if let Some(err) = store.last_error().await {
        bail!("{}", err);
    }
    println!("Gone.");
    Ok(())
}

async fn clear(backends: &Backends, yes: bool) -> Result<()> {
    if !yes {
        bail!("This deletes every task you own. Pass --yes to confirm.");
    }

    let store = open_store(backends).await?;
    store.clear_all().await?;
    println!("All tasks cleared.");
    Ok(())
}

async fn require_session(backends: &Backends) -> Result<tasktrack::models::Session> {
    backends
        .auth
        .current_session()
        .await?
        .ok_or_else(|| eyre!("Not signed in. Run `tasktrack login` first."))
}

async fn open_store(backends: &Backends) -> Result<TaskStore> {
    let session = require_session(backends).await?;
    let store = TaskStore::new(backends.tasks.clone(), session.user.id);
    store.load().await?;
    Ok(store)
}

/// Find the one task whose id starts with `prefix`.
fn resolve_id<'a>(tasks: &'a [Task], prefix: &str) -> Result<&'a Task> {
    let matches: Vec<&Task> = tasks.iter().filter(|t| t.id.starts_with(prefix)).collect();
    match matches.as_slice() {
        [] => bail!("No task matches id '{}'", prefix),
        [task] => Ok(task),
        _ => bail!("Id '{}' is ambiguous ({} matches)", prefix, matches.len()),
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

async fn wait_for_enter() {
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    let _ = reader.read_line(&mut line).await;
}
