mod cli;
mod config;
mod env;
mod error;
mod fanout;
mod gateway;
mod runner;
#[cfg(test)]
mod test_utils;

use crate::cli::Args;
use crate::config::load_targets;
use crate::env::{Env, ProcessEnv};
use crate::fanout::FanOut;
use crate::gateway::Gateway;
use crate::runner::TargetRunner;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tunnel_manager::ExternalSshTransport;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_filter());

    let targets = load_targets(&args.file)?;
    tracing::debug!(
        event = "config.loaded",
        file = %args.file.display(),
        targets = targets.len(),
        "config loaded"
    );

    let env: Arc<dyn Env> = Arc::new(ProcessEnv);
    let transport = Arc::new(ExternalSshTransport::new(args.ssh_client(), args.backoff()));
    let gateway = Gateway::new(transport, args.gateway_settings(), Arc::clone(&env));
    let runner = TargetRunner::new(args.compose_bin.clone(), gateway, env);
    let fan_out = FanOut::new(Arc::new(runner));

    match fan_out.run_all(&targets, &args.args, args.mode()).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            for failure in err.failures() {
                tracing::error!(
                    target_name = %failure.name,
                    error = %failure.error,
                    "target failed"
                );
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_tracing(default_filter: Option<&str>) {
    let Some(default_filter) = default_filter else {
        return;
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
