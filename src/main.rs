use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use animedex::{snapshot, AppError, Database, HttpGateway, Reconciler};

const DEFAULT_SOURCE_URL: &str = "https://api.animedex.example";

#[derive(Parser, Debug)]
#[command(name = "animedex", version, about = "Local mirror of a remote anime index")]
struct Cli {
    /// Database file (defaults to ANIMEDEX_DB, then the platform data dir)
    #[arg(long)]
    db: Option<PathBuf>,
    /// Base url of the source API (defaults to ANIMEDEX_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Resolve recent episode urls against the catalog and print the feed views
    Recents {
        /// Episode urls, in feed order
        #[arg(required = true)]
        episodes: Vec<String>,
    },
    /// Fetch and store every anime the source directory lists
    Build,
    /// Write the catalog to a snapshot document
    Export {
        #[arg(default_value = "directory.json")]
        path: PathBuf,
    },
    /// Load a snapshot document into the catalog
    Import {
        #[arg(default_value = "directory.json")]
        path: PathBuf,
    },
}

fn database_path(cli: &Cli) -> Result<PathBuf, AppError> {
    if let Some(path) = &cli.db {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("ANIMEDEX_DB") {
        return Ok(PathBuf::from(path));
    }
    let base = dirs::data_dir().ok_or(AppError::Other(
        "Could not determine a data directory; pass --db".to_string(),
    ))?;
    Ok(base.join("animedex").join("animedex.db"))
}

fn source_url(cli: &Cli) -> String {
    cli.source_url
        .clone()
        .or_else(|| std::env::var("ANIMEDEX_SOURCE_URL").ok())
        .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string())
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let db_path = database_path(&cli)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(&db_path)?;

    match cli.command {
        Commands::Recents { ref episodes } => {
            let gateway = HttpGateway::new(&source_url(&cli))?;
            let reconciler = Reconciler::new(&db, &gateway);
            let recents = reconciler.resolve_recents(episodes).await?;
            println!("{}", serde_json::to_string_pretty(&recents)?);
        }
        Commands::Build => {
            let gateway = HttpGateway::new(&source_url(&cli))?;
            let reconciler = Reconciler::new(&db, &gateway);
            let report = reconciler.build_directory().await?;
            for err in &report.errors {
                log::warn!("{}", err);
            }
            log::info!(
                "Directory build applied {} animes ({} errors)",
                report.applied,
                report.errors.len()
            );
        }
        Commands::Export { path } => {
            snapshot::write_snapshot(&db, &path)?;
            log::info!("Snapshot written to {}", path.display());
        }
        Commands::Import { path } => {
            let report = snapshot::read_snapshot(&db, &path)?;
            for err in &report.errors {
                log::warn!("{}", err);
            }
            log::info!(
                "Snapshot restore applied {} animes ({} errors)",
                report.applied,
                report.errors.len()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
