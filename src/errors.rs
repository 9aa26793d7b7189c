use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OnDemandError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(ondemand::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(ondemand::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(ondemand::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(ondemand::db))]
    Db(#[from] sea_orm::DbErr),

    /// Bad or missing input, reported synchronously to the caller. Never retried.
    #[error("{0}")]
    #[diagnostic(code(ondemand::validation))]
    Validation(String),

    /// The external scheduler daemon could not be reached or refused the call.
    /// The scheduling protocol aborts without committing any store mutation.
    #[error("Scheduler unavailable: {0}")]
    #[diagnostic(code(ondemand::scheduler_unavailable))]
    SchedulerUnavailable(String),

    /// The grading backend refused or errored at fire time. Recorded as a
    /// terminal `failed` status; never retried automatically.
    #[error("Grading backend failed to start run: {0}")]
    #[diagnostic(code(ondemand::backend_start))]
    BackendStartFailure(String),

    /// A scheduler job id with zero (or otherwise unexpected) matching store
    /// records. Logged and handled defensively, never a crash.
    #[error("Inconsistent scheduler reference: {0}")]
    #[diagnostic(code(ondemand::inconsistent_reference))]
    InconsistentReference(String),

    #[error("{0}")]
    #[diagnostic(code(ondemand::other))]
    Other(String),
}
