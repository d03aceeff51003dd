use crate::env::ResolutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum EstablishError {
    #[error("resolve ssh {field}: {source}")]
    Resolve {
        field: &'static str,
        #[source]
        source: ResolutionError,
    },

    #[error("invalid docker host address {addr:?}: {reason}")]
    Address { addr: String, reason: String },

    #[error("tunnel: {0:#}")]
    Transport(anyhow::Error),
}

/// Why one target's command did not succeed.
#[derive(Debug, Error)]
pub(crate) enum RunError {
    #[error("resolve docker_host: {0}")]
    Resolve(#[source] ResolutionError),

    #[error(transparent)]
    Establish(#[from] EstablishError),

    #[error("launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", exit_description(.code))]
    Exit { code: Option<i32> },

    #[error("task failed: {0}")]
    Task(String),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Debug, Error)]
#[error("{name}: {error}")]
pub(crate) struct TargetFailure {
    pub(crate) name: String,
    #[source]
    pub(crate) error: RunError,
}

/// Every failure of a fan-out run, in the order they were recorded.
#[derive(Debug, Error)]
#[error("{}", render(.failures))]
pub(crate) struct AggregateError {
    failures: Vec<TargetFailure>,
}

impl AggregateError {
    /// `None` when nothing failed.
    pub(crate) fn from_failures(failures: Vec<TargetFailure>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    pub(crate) fn failures(&self) -> &[TargetFailure] {
        &self.failures
    }
}

fn render(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
