use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use db::{SqliteStore, Store};
use syncd_core::{Config, Task, TaskConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE: &str = "syncd.toml";

#[derive(Parser)]
#[command(name = "syncd")]
#[command(about = "Keeps infrastructure in sync with service discovery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config and create the task store.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Check the config and every task in it.
    Validate,
    /// List stored tasks.
    Tasks,
    /// Show recent runs of a task, newest first.
    Events { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_tracing(syncd_core::DEFAULT_LOG_LEVEL);
            init_project(&cli.config, force).await
        }
        Commands::Validate => {
            let config = load_config(&cli.config).await?;
            init_tracing(config.log_level());
            validate(config)
        }
        Commands::Tasks => {
            let config = load_config(&cli.config).await?;
            init_tracing(config.log_level());
            list_tasks(config).await
        }
        Commands::Events { name } => {
            let config = load_config(&cli.config).await?;
            init_tracing(config.log_level());
            list_events(config, &name).await
        }
    }
}

fn starter_config() -> Config {
    Config::default().with_task(
        TaskConfig::named("example_task")
            .with_module("org/example/module")
            .with_services(["api"]),
    )
}

async fn write_config(path: &Path, config: &Config) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to encode config")?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn load_config(path: &Path) -> Result<Config> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.finalize();
    Ok(config)
}

async fn init_project(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    let mut config = starter_config();
    write_config(path, &config).await?;
    config.finalize();

    tokio::fs::create_dir_all(config.working_dir())
        .await
        .context("Failed to create working directory")?;
    SqliteStore::open(config.clone())
        .await
        .context("Failed to initialize task store")?;

    println!();
    println!("Initialized syncd");
    println!();
    println!("Created:");
    println!("  {}", path.display());
    println!("  {}/", config.working_dir().display());
    println!("  {}", config.database_url());
    println!();
    println!("Next steps:");
    println!("  1. Edit {} to describe your tasks", path.display());
    println!("  2. Run 'syncd validate'");

    Ok(())
}

fn validate(config: Config) -> Result<()> {
    config.validate().context("Invalid config")?;
    for conf in &config.tasks {
        let task = Task::from_config(conf)
            .with_context(|| format!("Invalid task {}", conf.name_or_empty()))?;
        println!("  {} {} ({})", "✓".green(), task.name(), task.kind().as_str());
    }
    println!();
    println!("{} task(s) valid", config.tasks.len());
    Ok(())
}

async fn list_tasks(config: Config) -> Result<()> {
    let store = SqliteStore::open(config)
        .await
        .context("Failed to open task store")?;
    let tasks = store.get_all_tasks().await?;

    println!();
    if tasks.is_empty() {
        println!("No tasks yet.");
        return Ok(());
    }

    println!("Tasks ({}):", tasks.len());
    for conf in &tasks {
        let state = if conf.enabled.unwrap_or(true) {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        let kind = if conf.is_scheduled() { "scheduled" } else { "dynamic" };
        println!(
            "  [{}] {} {} {}",
            state,
            conf.name_or_empty(),
            kind.dimmed(),
            conf.module.as_deref().unwrap_or("-")
        );
    }
    println!();
    Ok(())
}

async fn list_events(config: Config, name: &str) -> Result<()> {
    let store = SqliteStore::open(config)
        .await
        .context("Failed to open task store")?;
    if store.get_task(name).await?.is_none() {
        anyhow::bail!("Task not found: {}", name);
    }
    let events = store.get_task_events(name).await?;

    println!();
    if events.is_empty() {
        println!("No runs recorded for {}.", name);
        return Ok(());
    }

    println!("Runs of {} ({}):", name, events.len());
    for event in &events {
        let icon = if event.success { "●".green() } else { "●".red() };
        let started = event
            .start_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let took = event
            .duration()
            .map(|d| format!("{}ms", d.num_milliseconds()))
            .unwrap_or_else(|| "-".to_string());
        match &event.error {
            Some(err) => println!("  {} {} {} {}", icon, started, took, err.message),
            None => println!("  {} {} {}", icon, started, took),
        }
    }
    println!();
    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
}
