use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use playlist_reconcile as lib;
use lib::api::{spotify::SpotifyAdapter, youtube::YouTubeAdapter, Adapter};
use lib::config::Config;
use lib::fallback::{HumanVerifier, WebSearchResolver};
use lib::manager::Manager;
use lib::models::{PlaylistRef, ProviderKind};
use lib::state::RunState;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "playlist-reconcile", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Plan mode: report adds/removes without performing them
    #[arg(long)]
    plan: bool,

    /// Override the duplicate similarity threshold (0..=1)
    #[arg(long)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count tracks per artist in a playlist
    Summarize {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        playlist: String,
    },
    /// Add source tracks that are missing from the destination playlist
    AddMissing {
        /// Source playlist as provider:id
        #[arg(long)]
        from: PlaylistRef,
        /// Destination playlist as provider:id
        #[arg(long)]
        to: PlaylistRef,
    },
    /// Remove duplicate tracks, keeping the first of each group
    Dedupe {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        playlist: String,
    },
    /// Remove every track by the given artists
    RemoveArtists {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        playlist: String,
        #[arg(long = "artist", required = true)]
        artists: Vec<String>,
    },
    /// Validate config file and exit
    ConfigValidate,
    /// Store a provider token JSON (must contain access_token) in the DB
    StoreToken {
        #[arg(long)]
        provider: ProviderKind,
        #[arg(long)]
        token_json: String,
    },
}

/// Waits for the operator to solve the search engine's bot check in a browser.
struct TerminalVerifier;

#[async_trait]
impl HumanVerifier for TerminalVerifier {
    async fn confirm(&self, challenge_url: &str) -> bool {
        eprintln!("Web search requires a human check. Open this URL, solve it, then press Enter:");
        eprintln!("  {}", challenge_url);
        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| n > 0)
        })
        .await;
        matches!(read, Ok(Ok(true)))
    }
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(p) => Config::from_path(p).with_context(|| format!("loading config from {}", p.display())),
        None => {
            let local = Path::new("playlist-reconcile.toml");
            if local.exists() {
                Config::from_path(local).with_context(|| format!("loading config from {}", local.display()))
            } else {
                Ok(Config::default())
            }
        }
    }
}

/// Env var first, then the credential DB.
fn access_token(cfg: &Config, provider: ProviderKind) -> Result<Option<String>> {
    let var = match provider {
        ProviderKind::Spotify => "SPOTIFY_ACCESS_TOKEN",
        ProviderKind::YouTube => "YOUTUBE_ACCESS_TOKEN",
    };
    if let Ok(tok) = std::env::var(var) {
        if !tok.trim().is_empty() {
            return Ok(Some(tok));
        }
    }
    if !cfg.db_path.exists() {
        return Ok(None);
    }
    let conn = lib::db::open_or_create(&cfg.db_path)?;
    lib::db::access_token_for(&conn, provider)
}

fn build_manager(cfg: &Config) -> Result<Manager> {
    let mut manager = Manager::new(cfg.similarity()).with_concurrency_limit(cfg.concurrency_limit);

    for provider in [ProviderKind::Spotify, ProviderKind::YouTube] {
        let token = match access_token(cfg, provider)? {
            Some(t) => t,
            None => {
                log::warn!("No {} credentials found; {} playlists are unavailable", provider, provider);
                continue;
            }
        };
        let adapter: Arc<dyn Adapter> = match provider {
            ProviderKind::Spotify => {
                let mut a = SpotifyAdapter::new(token, cfg.retry_config(), cfg.concurrency_limit);
                if let Some(base) = &cfg.spotify_api_base {
                    a = a.with_api_base(base.as_str());
                }
                Arc::new(a)
            }
            ProviderKind::YouTube => {
                let mut a = YouTubeAdapter::new(token, cfg.retry_config(), cfg.concurrency_limit);
                if let Some(base) = &cfg.youtube_api_base {
                    a = a.with_api_base(base.as_str());
                }
                Arc::new(a)
            }
        };
        manager = manager.with_adapter(adapter);
    }

    let resolver = WebSearchResolver::new(cfg.similarity(), cfg.retry_config())
        .with_search_url(cfg.web_search_url.as_str())
        .with_throttle(Duration::from_millis(cfg.web_search_throttle_ms))
        .with_max_results(cfg.web_search_max_results)
        .with_verifier(Arc::new(TerminalVerifier));
    Ok(manager.with_fallback(Arc::new(resolver)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;
    if cli.plan {
        cfg.plan_mode = true;
    }
    if let Some(t) = cli.threshold {
        cfg.similarity_threshold = t;
    }

    if let Commands::ConfigValidate = cli.command {
        match cfg.validate() {
            Ok(()) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }
    cfg.validate()?;

    // Initialize log->tracing bridge and structured logging.
    // Logs go to stderr and a daily-rotated file in cfg.log_dir; stdout carries results.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "playlist-reconcile.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    tracing_subscriber_global::set_global_default(subscriber).context("installing tracing subscriber")?;

    if let Commands::StoreToken { provider, token_json } = &cli.command {
        let conn = lib::db::open_or_create(&cfg.db_path)?;
        lib::db::save_credential_raw(&conn, *provider, token_json)?;
        log::info!("Stored {} credentials in {}", provider, cfg.db_path.display());
        return Ok(());
    }

    let state = Arc::new(RunState::new(cfg.plan_mode));
    tracing::info!(run_id = %state.run_id(), plan_mode = cfg.plan_mode, "run started");
    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received; finishing in-flight calls and skipping the rest");
                state.interrupt();
            }
        });
    }

    let manager = build_manager(&cfg)?;
    match cli.command {
        Commands::Summarize { provider, playlist } => {
            let summary = manager
                .summarize_by_artist(&state, &PlaylistRef::new(provider, playlist))
                .await?;
            print_json(&summary)?;
        }
        Commands::AddMissing { from, to } => {
            let report = manager.add_missing(&state, &from, &to).await?;
            print_json(&report)?;
        }
        Commands::Dedupe { provider, playlist } => {
            let report = manager.dedupe(&state, &PlaylistRef::new(provider, playlist)).await?;
            print_json(&report)?;
        }
        Commands::RemoveArtists { provider, playlist, artists } => {
            let report = manager
                .remove_by_artists(&state, &PlaylistRef::new(provider, playlist), &artists)
                .await?;
            print_json(&report)?;
        }
        Commands::ConfigValidate | Commands::StoreToken { .. } => {}
    }
    Ok(())
}
