use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use encore::cache::LocalCache;
use encore::catalog::{CatalogService, SpotifyCatalog};
use encore::config::{self, Config};
use encore::error::{CatalogError, GenerationError};
use encore::generate::{OpenRouterClient, TextGenerator};
use encore::store::FileStore;
use encore::subject::{ArtistProfile, Identity, Shape, Subject};
use encore::{Pipeline, RecommendationRequest};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "encore",
    about = "Artist recommendations and influence trees, cached and generated on demand",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Get recommendations for an artist (name or spotify:artist:<id>)
    Recommend {
        subject: String,
        /// Build an influence tree instead of a flat list
        #[arg(long)]
        influences: bool,
        /// Regenerate even if cached or previously failed
        #[arg(long)]
        force_refresh: bool,
        /// Identity to charge; omitted means anonymous (cache only)
        #[arg(long)]
        user: Option<String>,
    },
    /// Show cache and failure state for an artist
    Status {
        subject: String,
        #[arg(long)]
        influences: bool,
    },
    /// Show or reset an identity's generation quota
    Quota {
        user: String,
        #[arg(long)]
        reset: bool,
    },
    /// List featured results
    Featured,
    /// Search the catalog for artists
    Suggest {
        query: String,
        #[arg(long, default_value = "8")]
        limit: usize,
    },
    /// Store precomputed recommendations from a JSON file
    Ingest {
        subject: String,
        file: PathBuf,
        #[arg(long)]
        featured: bool,
        #[arg(long)]
        influences: bool,
    },
    /// Store API credentials in the system keychain
    Setup,
}

fn shape_for(influences: bool) -> Shape {
    if influences {
        Shape::Influences
    } else {
        Shape::Recommendations
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Stand-in when no OpenRouter key is configured; cache reads still work.
struct NoGenerator;

#[async_trait]
impl TextGenerator for NoGenerator {
    async fn generate(&self, _system: &str, _user: &str) -> Result<String, GenerationError> {
        Err(GenerationError::MissingApiKey)
    }
}

/// Stand-in when Spotify credentials are missing.
struct NoCatalog;

#[async_trait]
impl CatalogService for NoCatalog {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<ArtistProfile>, CatalogError> {
        Err(CatalogError::MissingCredentials)
    }

    async fn get_by_id(&self, _id: &str) -> Result<Option<ArtistProfile>, CatalogError> {
        Err(CatalogError::MissingCredentials)
    }
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let store = Arc::new(FileStore::new(&data_dir));
    let local = LocalCache::with_snapshot(data_dir.join("local_cache.json"));

    let generator: Arc<dyn TextGenerator> =
        match OpenRouterClient::from_key(config.get_api_key(), config.model()) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::debug!(error = %err, "generation disabled");
                Arc::new(NoGenerator)
            }
        };
    let catalog: Arc<dyn CatalogService> = match SpotifyCatalog::from_credentials(
        config.spotify_client_id(),
        config.spotify_client_secret(),
    ) {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            tracing::debug!(error = %err, "catalog lookups disabled");
            Arc::new(NoCatalog)
        }
    };

    Ok(Pipeline::new(
        config.pipeline_settings(),
        local,
        store.clone(),
        store,
        catalog,
        generator,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if let Command::Setup = args.command {
        return config::setup_interactive().map_err(anyhow::Error::msg);
    }

    let config = Config::load();
    let pipeline = build_pipeline(&config)?;
    let outcome = run(&pipeline, args.command).await;

    if let Err(err) = pipeline.cache().local().save_snapshot() {
        tracing::warn!(error = %err, "failed to save local cache snapshot");
    }
    outcome
}

async fn run(pipeline: &Pipeline, command: Command) -> Result<()> {
    match command {
        Command::Recommend {
            subject,
            influences,
            force_refresh,
            user,
        } => {
            let identity = user.map(Identity::user).unwrap_or(Identity::Anonymous);
            let request = RecommendationRequest::new(Subject::parse(&subject), identity)
                .with_shape(shape_for(influences))
                .forced(force_refresh);
            match pipeline.get_recommendations(request).await {
                Ok(result) => print_json(&result),
                Err(err) => {
                    anyhow::bail!("{} ({})", err, err.status_code())
                }
            }
        }
        Command::Status {
            subject,
            influences,
        } => {
            let status = pipeline
                .check_cache_status(&Subject::parse(&subject), shape_for(influences))
                .await;
            print_json(&status)
        }
        Command::Quota { user, reset } => {
            if reset {
                pipeline.quota().reset(&user).await?;
            }
            match pipeline.quota().record(&user).await? {
                Some(record) => print_json(&record),
                None => {
                    println!(
                        "{} has not generated anything yet ({} remaining)",
                        user,
                        pipeline.quota().limit()
                    );
                    Ok(())
                }
            }
        }
        Command::Featured => print_json(&pipeline.featured().await),
        Command::Suggest { query, limit } => {
            print_json(&pipeline.suggest_subjects(&query, limit).await)
        }
        Command::Ingest {
            subject,
            file,
            featured,
            influences,
        } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", file.display()))?;
            let result = pipeline
                .ingest(
                    &Subject::parse(&subject),
                    shape_for(influences),
                    payload,
                    featured,
                )
                .await?;
            print_json(&result)
        }
        Command::Setup => Ok(()),
    }
}
