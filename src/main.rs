use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use etcdrift::cfg::{self, Config};
use etcdrift::report::{self, UpdateReport};
use etcdrift::ui;
use etcdrift::workspace::{Workspace, WorkspaceState};

/// A git based tool that reconciles package-shipped and locally customized /etc files on Arch Linux
#[derive(Parser)]
#[command(name = "etcdrift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (defaults to ~/.config/etcdrift/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the etc tree
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    /// Git repository of the vendor and user lineages
    #[arg(long, global = true, env = "ETCDRIFT_REPO")]
    repo_dir: Option<PathBuf>,

    /// Package cache directory, may be repeated
    #[arg(long = "cache-dir", global = true)]
    cache_dirs: Vec<PathBuf>,

    /// Directory of locally built packages, scanned recursively
    #[arg(long, global = true)]
    aur_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repository and run a first update
    Create,

    /// Record package and user changes since the last update
    Update {
        /// Report what would change without committing anything
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy the files merged by the last update to /etc
    Sync {
        /// List the files without copying them
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the files of /etc that no package installs
    Diff {
        /// Compare with the staging vendor lineage when there is one
        #[arg(long)]
        use_staging: bool,
    },

    /// Show the state of the workspace
    Status {
        /// Print the state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etcdrift=error")),
        )
        .with_writer(std::io::stderr)
        .init();

    ui::init();

    let result = match load_config(&cli) {
        Ok(config) => match cli.command {
            Commands::Create => cmd_create(config).await,
            Commands::Update { dry_run, json } => cmd_update(config, dry_run, json).await,
            Commands::Sync { dry_run, yes, json } => cmd_sync(config, dry_run, yes, json).await,
            Commands::Diff { use_staging } => cmd_diff(config, use_staging).await,
            Commands::Status { json } => cmd_status(config, json).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        ui::error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config_path = cli.config.clone().unwrap_or_else(cfg::default_config_path);
    let mut config = cfg::load(&config_path)?;

    if let Some(root_dir) = &cli.root_dir {
        config.general.root_dir = root_dir.clone();
    }
    if let Some(repo_dir) = &cli.repo_dir {
        config.general.repo_dir = repo_dir.clone();
    }
    if !cli.cache_dirs.is_empty() {
        config.packages.cache_dirs = cli.cache_dirs.clone();
    }
    if let Some(aur_dir) = &cli.aur_dir {
        config.packages.aur_dir = Some(aur_dir.clone());
    }
    Ok(config)
}

fn print_update(report: &UpdateReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("Failed to serialize report")?);
    } else {
        report.print();
    }
    Ok(())
}

async fn cmd_create(config: Config) -> Result<()> {
    ui::info(&format!(
        "Creating the repository at {}...",
        config.general.repo_dir.display()
    ));
    let spinner = ui::spinner("Scanning the package caches...");
    let report = tokio::task::spawn_blocking(move || -> Result<UpdateReport> {
        let mut workspace = Workspace::create(&config).context("Failed to create the repository")?;
        let report = workspace.update(false)?;
        workspace.close()?;
        Ok(report)
    })
    .await
    .context("Update task failed")?;
    spinner.finish_and_clear();

    let report = report?;
    print_update(&report, false)?;
    ui::success("Repository created");
    Ok(())
}

async fn cmd_update(config: Config, dry_run: bool, json: bool) -> Result<()> {
    let spinner = ui::spinner("Scanning the package caches...");
    let report = tokio::task::spawn_blocking(move || -> Result<UpdateReport> {
        let mut workspace = Workspace::open(&config)?;
        let report = workspace.update(dry_run)?;
        workspace.close()?;
        Ok(report)
    })
    .await
    .context("Update task failed")?;
    spinner.finish_and_clear();

    print_update(&report?, json)
}

async fn cmd_sync(config: Config, dry_run: bool, yes: bool, json: bool) -> Result<()> {
    let mut workspace = Workspace::open(&config)?;

    if !dry_run && !yes && !json {
        let preview = workspace.sync(true)?;
        if preview.commit.is_none() {
            preview.print();
            return Ok(());
        }
        report::print_paths("Files to copy to /etc", &preview.synced);
        if !ui::prompt_confirm("Copy these files to /etc?", true) {
            ui::info("Sync cancelled");
            return Ok(());
        }
    }

    let report = workspace.sync(dry_run)?;
    workspace.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
    } else {
        report.print();
    }
    Ok(())
}

async fn cmd_diff(config: Config, use_staging: bool) -> Result<()> {
    let workspace = Workspace::open(&config)?;
    let files = workspace.diff(use_staging)?;

    if files.is_empty() {
        ui::success("Every file in /etc belongs to a package");
    } else {
        ui::info(&format!("{} files not installed by a package:", files.len()));
        for file in &files {
            println!("  {}", file.display());
        }
    }
    Ok(())
}

async fn cmd_status(config: Config, json: bool) -> Result<()> {
    let state = Workspace::status(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state).context("Failed to serialize state")?);
        return Ok(());
    }

    match state {
        WorkspaceState::Idle => ui::success("No pending update"),
        WorkspaceState::Staged => {
            ui::warn("An incomplete update left staging branches behind");
            ui::hint("The next 'etcdrift update' discards them");
        }
        WorkspaceState::PendingMerge { commit } => {
            ui::info(&format!("Merged package upgrades are pending in {}", commit.dimmed()));
            ui::hint("Run 'etcdrift sync' to copy them to /etc");
        }
        WorkspaceState::Conflicted { paths } => {
            ui::warn("A merge of package upgrades is in progress");
            for path in &paths {
                println!("  {} {}", "conflict:".red(), path.display());
            }
            ui::hint("Resolve the conflicts and commit without changing the commit message");
        }
    }
    Ok(())
}
