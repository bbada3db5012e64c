//! InkStone command line
//!
//! Edits text files of a GitHub repository through the local cache and
//! pushes them back as single commits.

mod prompt;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use inkstone_core::file_tree::render;
use inkstone_core::{
    CommitAction, ConflictResolver, ContentStore, DirtyState, Engine, EngineConfig, FixedResolver,
    ReconcileReport, RepoId, RepoSession, Resolution,
};
use inkstone_github::GitHubClient;
use prompt::{PromptResolver, short_sha};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "inkstone")]
#[command(author = "InkStone Contributors")]
#[command(version)]
#[command(about = "Local-first editing of text files in a GitHub repository")]
struct Cli {
    /// Configuration file (defaults to <data-dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the cache and configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Repository as owner/name
    #[arg(short, long, global = true, env = "INKSTONE_REPO")]
    repo: Option<String>,

    /// Branch to work on
    #[arg(short, long, global = true)]
    branch: Option<String>,

    /// GitHub access token
    #[arg(long, global = true, env = "INKSTONE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// How conflicts found during sync or commit are settled
    #[arg(long, global = true, value_enum, default_value_t = ConflictPolicy::Ask)]
    on_conflict: ConflictPolicy,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ConflictPolicy {
    /// Prompt for every conflict
    Ask,
    /// Always keep the local version
    Keep,
    /// Always take the remote version
    Discard,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show sync state and pending changes
    Status,

    /// List files known locally or remotely
    Ls,

    /// Show the file tree
    Tree,

    /// Print a file
    Cat {
        /// Path inside the repository
        path: String,
    },

    /// Replace a file's content (from --file or stdin)
    Edit {
        path: String,

        /// Read the new content from this file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Create a new file
    New {
        path: String,

        /// Initial content from this file (empty if omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete a file (until the next commit it can be restored)
    Rm { path: String },

    /// Undo a pending delete
    Restore { path: String },

    /// List pending deletes
    Deleted,

    /// Show the operations the next commit would push
    Diff,

    /// Reconcile with the remote branch
    Sync,

    /// Re-pull files that changed remotely
    Refresh,

    /// Push all pending changes as one commit
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,
    },

    /// Check the token, push permission and branch
    Check,

    /// List cached repositories
    Repos,

    /// Drop everything cached for the repository, pending edits included
    Clear {
        /// Confirm discarding uncommitted edits
        #[arg(long)]
        yes: bool,
    },

    /// Write the effective configuration to the config file
    InitConfig,
}

/// Everything a command needs, built from flags and the config file.
struct App {
    config: EngineConfig,
    config_path: PathBuf,
    client: Arc<GitHubClient>,
    engine: Engine,
    repo: Option<RepoId>,
    branch: String,
}

impl App {
    fn build(cli: &Cli) -> Result<Self> {
        let (mut config, config_path) = load_config(cli)?;
        if let Some(dir) = &cli.data_dir {
            config.data_dir = dir.clone();
        }

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Cannot create data directory {}", config.data_dir.display())
        })?;
        let store = ContentStore::open(&config.store_path()).with_context(|| {
            format!("Cannot open content store {}", config.store_path().display())
        })?;

        let token = cli.token.clone().unwrap_or_default();
        if token.is_empty() {
            debug!("No token given, using anonymous access");
        }
        let client = Arc::new(GitHubClient::from_config(&token, &config)?);

        let resolver: Arc<dyn ConflictResolver> = match cli.on_conflict {
            ConflictPolicy::Ask => Arc::new(PromptResolver),
            ConflictPolicy::Keep => Arc::new(FixedResolver(Resolution::KeepLocal)),
            ConflictPolicy::Discard => Arc::new(FixedResolver(Resolution::DiscardLocal)),
        };
        let engine = Engine::new(Arc::new(store), client.clone(), resolver)
            .with_listing_ttl(config.tree_cache_ttl());

        let repo = match cli.repo.as_deref().or(config.default_repository.as_deref()) {
            Some(r) => Some(r.parse::<RepoId>().with_context(|| format!("Bad repository {:?}", r))?),
            None => None,
        };
        let branch = cli
            .branch
            .clone()
            .unwrap_or_else(|| config.default_branch.clone());

        Ok(Self {
            config,
            config_path,
            client,
            engine,
            repo,
            branch,
        })
    }

    fn repo(&self) -> Result<&RepoId> {
        self.repo
            .as_ref()
            .ok_or_else(|| anyhow!("No repository given (use --repo owner/name or INKSTONE_REPO)"))
    }

    fn session(&self) -> Result<Arc<RepoSession>> {
        Ok(self.engine.session(self.repo()?, &self.branch)?)
    }
}

fn load_config(cli: &Cli) -> Result<(EngineConfig, PathBuf)> {
    if let Some(path) = &cli.config {
        let config = EngineConfig::load(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        return Ok((config, path.clone()));
    }
    let dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| EngineConfig::default().data_dir);
    let config = EngineConfig::load_from_dir(&dir)
        .with_context(|| format!("Cannot read config in {}", dir.display()))?;
    let path = config.config_path();
    Ok((config, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("inkstone=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let app = App::build(&cli)?;

    match cli.command {
        Commands::Status => cmd_status(&app).await,
        Commands::Ls => cmd_ls(&app).await,
        Commands::Tree => cmd_tree(&app).await,
        Commands::Cat { path } => cmd_cat(&app, &path).await,
        Commands::Edit { path, file } => cmd_edit(&app, &path, file).await,
        Commands::New { path, file } => cmd_new(&app, &path, file).await,
        Commands::Rm { path } => cmd_rm(&app, &path).await,
        Commands::Restore { path } => cmd_restore(&app, &path).await,
        Commands::Deleted => cmd_deleted(&app).await,
        Commands::Diff => cmd_diff(&app).await,
        Commands::Sync => cmd_sync(&app).await,
        Commands::Refresh => cmd_refresh(&app).await,
        Commands::Commit { message } => cmd_commit(&app, &message).await,
        Commands::Check => cmd_check(&app).await,
        Commands::Repos => cmd_repos(&app),
        Commands::Clear { yes } => cmd_clear(&app, yes).await,
        Commands::InitConfig => cmd_init_config(&app),
    }
}

async fn cmd_status(app: &App) -> Result<()> {
    let status = app.session()?.status().await?;

    println!("Repository: {}@{}", status.repository, status.branch);
    println!("  Phase:     {}", status.phase);
    println!(
        "  Tree:      {}",
        status.last_known_tree_sha.as_deref().map(short_sha).unwrap_or("-")
    );
    println!(
        "  Commit:    {}",
        status.last_commit_sha.as_deref().map(short_sha).unwrap_or("-")
    );
    println!("  Synced at: {}", format_timestamp(status.last_sync_timestamp));

    if status.pending.is_empty() {
        println!("\nNo pending changes.");
    } else {
        println!("\nPending changes ({}):", status.pending.len());
        for op in &status.pending {
            println!("  {:<7} {}", op.action_name(), op.path);
        }
    }
    if !status.stale.is_empty() {
        println!("\nChanged remotely, not yet re-pulled ({}):", status.stale.len());
        for path in &status.stale {
            println!("  {}", path);
        }
    }
    Ok(())
}

async fn cmd_ls(app: &App) -> Result<()> {
    let entries = app.session()?.list_files().await?;
    for entry in entries {
        let state = entry.state.as_ref().map(DirtyState::as_str).unwrap_or("remote");
        let size = entry.size.map(format_size).unwrap_or_else(|| "-".to_string());
        println!("{:<14} {:>10}  {}", state, size, entry.path);
    }
    Ok(())
}

async fn cmd_tree(app: &App) -> Result<()> {
    let nodes = app.session()?.file_tree().await?;
    print!("{}", render(&nodes));
    Ok(())
}

async fn cmd_cat(app: &App, path: &str) -> Result<()> {
    let content = app
        .session()?
        .open_file(path)
        .await
        .with_context(|| format!("Cannot open {}", path))?;
    print!("{}", content);
    Ok(())
}

async fn cmd_edit(app: &App, path: &str, file: Option<PathBuf>) -> Result<()> {
    let content = read_input(file, true)?;
    let record = app.session()?.save_file(path, &content).await?;
    println!("Saved {} ({})", record.path, record.dirty_state.as_str());
    Ok(())
}

async fn cmd_new(app: &App, path: &str, file: Option<PathBuf>) -> Result<()> {
    let content = read_input(file, false)?;
    let record = app
        .session()?
        .create_file(path, &content)
        .await
        .with_context(|| format!("Cannot create {}", path))?;
    println!("Created {}", record.path);
    Ok(())
}

async fn cmd_rm(app: &App, path: &str) -> Result<()> {
    app.session()?.delete_file(path).await?;
    println!("Deleted {}", path);
    Ok(())
}

async fn cmd_restore(app: &App, path: &str) -> Result<()> {
    app.session()?.restore_file(path).await?;
    println!("Restored {}", path);
    Ok(())
}

async fn cmd_deleted(app: &App) -> Result<()> {
    let deleted = app.session()?.list_deleted().await?;
    if deleted.is_empty() {
        println!("No pending deletes.");
    }
    for record in deleted {
        println!("{}", record.path);
    }
    Ok(())
}

async fn cmd_diff(app: &App) -> Result<()> {
    let ops = app.session()?.get_diff_summary().await?;
    if ops.is_empty() {
        println!("Nothing to commit.");
        return Ok(());
    }
    for op in &ops {
        match &op.action {
            CommitAction::Create(c) | CommitAction::Update(c) => {
                println!("{:<7} {} ({})", op.action_name(), op.path, format_size(c.len() as u64))
            }
            CommitAction::Delete => println!("{:<7} {}", op.action_name(), op.path),
        }
    }
    Ok(())
}

async fn cmd_sync(app: &App) -> Result<()> {
    let report = app.session()?.sync().await.context("Sync failed")?;
    print_report(&report);
    Ok(())
}

async fn cmd_refresh(app: &App) -> Result<()> {
    let refreshed = app.session()?.refresh_stale().await?;
    println!("Refreshed {} file(s)", refreshed.len());
    for path in refreshed {
        println!("  {}", path);
    }
    Ok(())
}

async fn cmd_commit(app: &App, message: &str) -> Result<()> {
    if message.trim().is_empty() {
        bail!("Commit message must not be empty");
    }
    let outcome = app.session()?.commit(message).await.context("Commit failed")?;
    let Some(outcome) = outcome else {
        println!("Nothing to commit.");
        return Ok(());
    };

    for report in &outcome.reconciliations {
        if !report.is_unchanged() {
            print_report(report);
        }
    }
    println!("Committed {} change(s):", outcome.operations.len());
    for op in &outcome.operations {
        println!("  {:<7} {}", op.action_name(), op.path);
    }
    println!("  Commit: {}", outcome.receipt.commit_sha);
    println!("  Tree:   {}", outcome.receipt.tree_sha);
    if outcome.retried() {
        println!("  (retried after the branch moved)");
    }
    Ok(())
}

async fn cmd_check(app: &App) -> Result<()> {
    let repo = app.repo()?;
    let report = app.client.check_access(repo, &app.branch).await?;

    println!("Login:          {}", report.login);
    println!("Repository:     {}", report.repository);
    println!("Default branch: {}", report.default_branch);
    println!("Push access:    {}", yes_no(report.push_access));
    println!("Branch {:<8} {}", format!("{}:", app.branch), yes_no(report.branch_exists));
    if !report.is_usable() {
        bail!("{} cannot be edited on {} with this token", repo, app.branch);
    }
    Ok(())
}

fn cmd_repos(app: &App) -> Result<()> {
    let repos = app.engine.repositories()?;
    if repos.is_empty() {
        println!("No cached repositories.");
    }
    for repo in repos {
        let state = app.engine.store().sync_state(&repo)?;
        let synced = state.map(|s| s.last_sync_timestamp).unwrap_or_default();
        let pending = app.engine.store().list_dirty(&repo)?.len();
        println!("{:<40} synced {}  {} dirty", repo, format_timestamp(synced), pending);
    }
    Ok(())
}

async fn cmd_clear(app: &App, yes: bool) -> Result<()> {
    let repo = app.repo()?;
    let dirty = app.engine.store().list_dirty(&repo.to_string())?;
    let pending = dirty
        .iter()
        .filter(|r| r.dirty_state != DirtyState::ChangedRemotely)
        .count();
    if pending > 0 && !yes {
        bail!("{} has {} uncommitted change(s); pass --yes to discard them", repo, pending);
    }
    app.engine.clear_repository(repo).await?;
    println!("Cleared {}", repo);
    Ok(())
}

fn cmd_init_config(app: &App) -> Result<()> {
    let mut config = app.config.clone();
    if config.default_repository.is_none() {
        config.default_repository = app.repo.as_ref().map(|r| r.to_string());
    }
    config.default_branch = app.branch.clone();
    config
        .save(&app.config_path)
        .with_context(|| format!("Cannot write {}", app.config_path.display()))?;
    println!("Wrote {}", app.config_path.display());
    Ok(())
}

fn print_report(report: &ReconcileReport) {
    if report.first_sync {
        println!("Initial sync at tree {}", short_sha(&report.tree_sha));
        return;
    }
    if report.is_unchanged() {
        println!("Already up to date.");
        return;
    }
    println!(
        "Remote moved {} -> {}",
        report.previous_tree_sha.as_deref().map(short_sha).unwrap_or("-"),
        short_sha(&report.tree_sha)
    );
    let changes = &report.changes;
    println!(
        "  Added: {}  Modified: {}  Removed: {}",
        changes.added.len(),
        changes.modified.len(),
        changes.removed.len()
    );
    for (conflict, resolution) in &report.conflicts {
        let decision = match resolution {
            Resolution::KeepLocal => "kept local",
            Resolution::DiscardLocal => "took remote",
        };
        println!("  Conflict {}: {}", conflict.path, decision);
    }
    if !report.stale.is_empty() {
        println!("  {} file(s) will be re-pulled on open", report.stale.len());
    }
    if !report.purged.is_empty() {
        println!("  {} cached file(s) dropped", report.purged.len());
    }
}

/// Content from `file`, or stdin when `stdin_default` is set.
fn read_input(file: Option<PathBuf>, stdin_default: bool) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display())),
        None if stdin_default => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Cannot read stdin")?;
            Ok(buf)
        }
        None => Ok(String::new()),
    }
}

fn format_timestamp(ts: i64) -> String {
    if ts == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
