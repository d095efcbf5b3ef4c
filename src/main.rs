//! taskcal-sync - Two-way sync between local tasks and an external calendar
//!
//! Pushes time-blocked tasks to Google Calendar as events and imports
//! calendar events back as tasks, resolving conflicts by last writer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod config;
mod db;
mod error;
mod import;
mod models;
mod provider;
mod push;
mod sync;
#[cfg(test)]
mod testing;
mod transcode;

use config::Config;

#[derive(Parser)]
#[command(name = "taskcal-sync")]
#[command(about = "Two-way task and calendar sync server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// User the token authenticates as
        #[arg(short, long)]
        user: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taskcal_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = if let Some(path) = config {
                Config::load_from(&path)?
            } else {
                Config::load()?
            };

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            user,
            list,
            revoke,
            config,
        } => {
            let config_path = if let Some(path) = config {
                path
            } else {
                Config::default_path()?
            };

            // List tokens
            if list {
                if !config_path.exists() {
                    println!("No config file found at {}", config_path.display());
                    println!("Run 'taskcal-sync init' to create one.");
                    return Ok(());
                }

                let cfg = Config::load_from(&config_path)?;
                if cfg.tokens.is_empty() {
                    println!("No tokens configured.");
                    println!("Generate one with: taskcal-sync token --name <device> --user <user-id>");
                } else {
                    println!("Configured tokens:");
                    println!();
                    for token in &cfg.tokens {
                        let hash_preview: String = token.token_hash.chars().take(20).collect();
                        println!("  {} ({}) - {}...", token.name, token.user_id, hash_preview);
                    }
                }
                return Ok(());
            }

            // Revoke token
            if let Some(token_name) = revoke {
                if !config_path.exists() {
                    println!("No config file found at {}", config_path.display());
                    return Ok(());
                }

                let mut cfg = Config::load_from(&config_path)?;
                let original_len = cfg.tokens.len();
                cfg.tokens.retain(|t| t.name != token_name);

                if cfg.tokens.len() == original_len {
                    println!("Token '{}' not found.", token_name);
                } else {
                    cfg.save_to(&config_path)?;
                    println!("Revoked token '{}'.", token_name);
                }
                return Ok(());
            }

            // Generate new token
            let Some(user_id) = user else {
                anyhow::bail!("--user is required when generating a token");
            };
            let token = generate_token();
            let label = name.unwrap_or_else(|| "default".to_string());
            let token_hash = config::hash_token(&token)?;

            // Auto-save to config if it exists
            if config_path.exists() {
                let mut cfg = Config::load_from(&config_path)?;

                if cfg.tokens.iter().any(|t| t.name == label) {
                    println!(
                        "Token '{}' already exists. Use --revoke first to replace it.",
                        label
                    );
                    return Ok(());
                }

                cfg.tokens.push(config::TokenConfig {
                    name: label.clone(),
                    user_id: user_id.clone(),
                    token_hash,
                });
                cfg.save_to(&config_path)?;

                println!("Generated API token '{}' for user '{}'\n", label, user_id);
                println!("Token: {}\n", token);
                println!("Saved to {}", config_path.display());
            } else {
                println!("Generated API token '{}' for user '{}':\n", label, user_id);
                println!("Token: {}\n", token);
                println!("Add this to your server's config.toml:\n");
                println!("  [[tokens]]");
                println!("  name = \"{}\"", label);
                println!("  user_id = \"{}\"", user_id);
                println!("  token_hash = \"{}\"\n", token_hash);
            }
            println!("Save this token now - it cannot be retrieved later!");

            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: taskcal-sync token --name my-device --user <user-id>");
            println!(
                "  2. Start the server: taskcal-sync serve --config {}",
                path.display()
            );

            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let db = db::Database::open(&config.database.path).context("Failed to open database")?;

    let calendar = provider::GoogleCalendarClient::new(
        &config.calendar.api_base,
        config.calendar.request_timeout(),
    )
    .context("Failed to build calendar client")?;

    let state = api::AppState::new(Arc::new(db), config.clone(), Arc::new(calendar));
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        calendar_api = %config.calendar.api_base,
        "taskcal-sync server listening on http://{}",
        addr
    );

    axum::serve(listener, app).await?;

    Ok(())
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("tcs_{}", token_body)
}
