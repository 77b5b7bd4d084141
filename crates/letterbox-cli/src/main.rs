use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use letterbox_adapters::MetadataSource;
use letterbox_storage::PgCatalogStore;
use letterbox_web::AppConfig;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "letterbox")]
#[command(about = "Letterbox movie catalog")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (default).
    Serve,
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Look a title up on the external site once and print the result.
    Scrape { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    info!(version = env!("CARGO_PKG_VERSION"), "letterbox starting");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let state = letterbox_web::build_state(&config).await?;
            letterbox_web::serve(&config, state).await?;
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgCatalogStore::connect(url, config.db_max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            store.close().await;
            println!("migrations applied");
        }
        Commands::Scrape { name } => {
            let scraper = letterbox_web::build_scraper(&config)?;
            match scraper.fetch(&name).await {
                Ok(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                Err(failure) => bail!("scrape failed for {name:?}: {failure}"),
            }
        }
    }

    Ok(())
}
