use clap::Parser;
use miette::{IntoDiagnostic, Result};
use ondemand::{daemon, settings, storage};
use migration::MigratorTrait;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "ondemand-scheduler",
    version,
    about = "Durable scheduler daemon for on-demand grading runs"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(scheduler = ?settings.scheduler, "Loaded configuration");

    // The job queue must be durable; apply migrations before polling it.
    let db = storage::init(&settings.database).await.into_diagnostic()?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    daemon::serve(settings, db).await?;
    Ok(())
}
