use self::cli::{Cli, Command};
use self::config::{ConfigLoadError, ReconcilerConfig};
use self::job::JobRunner;
use self::job::client::HttpConnector;
use self::job::definition::{JobDefinition, JobDefinitionError};
use self::job::error::JobError;
use self::job::waiter::target_events;
use self::kubernetes_objects::store::KubeStore;
use self::readiness_gate::GateKind;
use self::shutdown::Shutdown;
use std::path::PathBuf;
use thiserror::Error;
use tokio::select;
use tracing::info;
use tracing_error::ExtractSpanTrace;
use tracing_error::SpanTrace;

pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod kubernetes_objects;
pub mod readiness_gate;
pub mod reconciler;
pub mod shutdown;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to load job definition.\n{0}")]
    JobDefinition(#[from] JobDefinitionError),

    #[error("Failed to load config.\n{0}")]
    Config(#[from] ConfigLoadError),

    #[error("Failed to initialize kubernetes client.\n{0}")]
    KubeClient(#[from] kube::Error),

    #[error("Job stopped due to following error:\n{0}")]
    Job(#[from] JobError),

    #[error("Interrupted by {0}.")]
    Interrupted(&'static str),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::JobDefinition(_) | AppError::Config(_) => 2,
            AppError::Interrupted(_) => 130,
            AppError::KubeClient(_) | AppError::Job(_) => 1,
        }
    }
}

impl ExtractSpanTrace for AppError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            AppError::Job(e) => e.span_trace(),
            _ => None,
        }
    }
}

pub async fn app(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Command::Job { jobdef, gate } => run_job(&jobdef, gate).await,
        Command::Reconciler { config, namespace } => run_reconciler(config, namespace).await,
    }
}

async fn run_job(jobdef: &str, gate: GateKind) -> Result<(), AppError> {
    let mut shutdown = Shutdown::new();
    let def = JobDefinition::load(jobdef).await?;

    info!(
        "Job definition loaded: {} API calls against {}.",
        def.api_calls.len(),
        def.target
    );

    let client = kube::Client::try_default().await?;

    info!("Kubernetes Client Initialized.");

    let runner = JobRunner::new(KubeStore::new(client.clone()), HttpConnector, gate.protocol());
    let events = target_events(client, &def.target);

    select! {
        res = runner.run(&def, events) => res?,
        signal = shutdown.wait() => return Err(AppError::Interrupted(signal)),
    }

    info!("Job completed.");
    Ok(())
}

async fn run_reconciler(
    config: Option<PathBuf>,
    namespace: Option<String>,
) -> Result<(), AppError> {
    let mut config = ReconcilerConfig::new_from_file(config.as_deref()).await?;
    if namespace.is_some() {
        config.namespace = namespace;
    }

    info!("Config Loaded.");

    let client = kube::Client::try_default().await?;

    info!("Kubernetes Client Initialized.");

    reconciler::run(client, config).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            AppError::JobDefinition(JobDefinitionError::Invalid(vec![])).exit_code(),
            2
        );
        assert_eq!(
            AppError::Config(ConfigLoadError::InvalidErrorBackoff).exit_code(),
            2
        );
        assert_eq!(AppError::Interrupted("SIGINT").exit_code(), 130);
    }

    #[tokio::test]
    async fn test_invalid_job_definition_fails_before_connecting() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/testdata/bad_kind.yaml");
        let err = run_job(path, GateKind::PostProvision).await.unwrap_err();
        assert!(matches!(err, AppError::JobDefinition(_)));
        assert_eq!(err.exit_code(), 2);
    }
}
