use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::console::Term;
use dialoguer::{Input, Password};
use portalkeep::config::{default_config_path, ResolvedConfig};
use portalkeep::models::{TenantId, TenantMeta};
use portalkeep::storage::{JsonFileSessionStore, SessionStore};
use portalkeep::PortalService;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "portalkeep")]
#[command(about = "Log in to the portal, keep sessions alive and scrape records")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and confirm with a code
    Login {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        username: String,
    },
    /// Check whether the stored session is still authenticated
    Check {
        #[arg(long)]
        tenant: String,
    },
    /// Fetch records with the stored session and print them as JSON
    Fetch {
        #[arg(long)]
        tenant: String,
        /// Display name used in logs
        #[arg(long)]
        name: Option<String>,
    },
    /// Keep stored sessions alive until interrupted
    Keepalive,
    /// Show current configuration
    Config,
}

fn parse_tenant(value: &str) -> Result<TenantId> {
    Ok(TenantId::new(value)?)
}

fn read_password(username: &str) -> Result<String> {
    if let Ok(password) = std::env::var("PORTALKEEP_PASSWORD") {
        return Ok(password);
    }
    Password::new()
        .with_prompt(format!("Password for {username}"))
        .interact_on(&Term::stderr())
        .context("Failed to read password")
}

fn read_code() -> Result<String> {
    Input::<String>::new()
        .with_prompt("Confirmation code")
        .interact_text_on(&Term::stderr())
        .context("Failed to read confirmation code")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .json(),
        )
        .init();

    let cli = Cli::parse();
    let config = ResolvedConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;

    if let Command::Config = cli.command {
        println!("Config file: {}", cli.config.display());
        println!("Data directory: {}\n", config.data_dir.display());
        print!(
            "{}",
            toml::to_string_pretty(&config.engine_config()).context("Failed to render config")?
        );
        return Ok(());
    }

    let store: Arc<dyn SessionStore> = Arc::new(JsonFileSessionStore::new(&config.data_dir));
    let service = PortalService::builder(config.engine_config(), store).build()?;

    match cli.command {
        Command::Login { tenant, username } => {
            let tenant = parse_tenant(&tenant)?;
            let password = read_password(&username)?;
            let result = service.login(&username, &password, &tenant).await?;
            if !result.success {
                anyhow::bail!(
                    "Login rejected: {}",
                    result.message.unwrap_or_default()
                );
            }
            loop {
                let code = read_code()?;
                let result = service.login_with_code(&code, &tenant).await?;
                if result.success {
                    println!("Logged in.");
                    break;
                }
                eprintln!("{}", result.message.unwrap_or_default());
                if result.attempts_exhausted {
                    anyhow::bail!("Too many wrong codes; log in again");
                }
            }
        }
        Command::Check { tenant } => {
            let tenant = parse_tenant(&tenant)?;
            let status = service.is_logged_in(&tenant).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Fetch { tenant, name } => {
            let mut meta = TenantMeta::new(parse_tenant(&tenant)?);
            meta.display_name = name;
            let records = service.fetch_stored_records(&meta, None).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Keepalive => {
            let scheduler = service.keepalive_scheduler();
            let registered = scheduler.start().await?;
            info!(registered, "keep-alive running");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for Ctrl-C")?;
            scheduler.shutdown().await;
        }
        Command::Config => {}
    }

    Ok(())
}
