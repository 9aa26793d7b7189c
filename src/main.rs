use clap::Parser;
use miette::{IntoDiagnostic, Result};
use ondemand::{grading_api, sched_api, settings, storage, web};
use migration::MigratorTrait;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ondemand", version, about = "On-demand autograding portal")]
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

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(server = ?settings.server, scheduler = ?settings.scheduler, "Loaded configuration");

    // init storage (database) and apply migrations
    let db = storage::init(&settings.database).await.into_diagnostic()?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    // explicitly constructed outbound clients (swapped for doubles in tests)
    let tz = settings.tz().into_diagnostic()?;
    let scheduler = Arc::new(sched_api::SchedulerClient::new(&settings.scheduler.url));
    let backend = Arc::new(grading_api::JenkinsClient::new(
        &settings.backend.url,
        db.clone(),
        tz,
    ));

    web::serve(settings, db, scheduler, backend).await?;
    Ok(())
}
