use crate::config::DEFAULT_CONFIG_FILE;
use crate::fanout::Mode;
use crate::gateway::{GatewaySettings, DEFAULT_AGENT_ADDR, DEFAULT_REMOTE_SOCKET_ADDR};
use crate::runner::DEFAULT_COMPOSE_BIN;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tunnel_manager::{Backoff, SshClient};

#[derive(Parser, Debug)]
#[command(
    name = "compose-hosts",
    version,
    about = "Run one docker-compose command against every configured host"
)]
pub(crate) struct Args {
    /// Hosts config file, TOML only. YAML `docker-compose-hosts.yml` files
    /// must be converted first.
    #[arg(short = 'f', long = "file", default_value = DEFAULT_CONFIG_FILE)]
    pub(crate) file: PathBuf,
    /// Run every project at once instead of one after another.
    #[arg(long)]
    pub(crate) parallel: bool,
    #[arg(short = 'q', long = "logs-off", conflicts_with = "logs_verbose")]
    pub(crate) logs_off: bool,
    #[arg(short = 'v', long = "logs-verbose")]
    pub(crate) logs_verbose: bool,
    /// Agent socket, `$NAME` placeholders allowed.
    #[arg(long, default_value = DEFAULT_AGENT_ADDR)]
    pub(crate) ssh_agent_addr: String,
    /// Known hosts file for profiles that do not name one.
    #[arg(long)]
    pub(crate) ssh_known_hosts_file: Option<String>,
    #[arg(long, default_value = "ssh")]
    pub(crate) ssh_bin: String,
    /// Extra argument for the ssh client; repeatable.
    #[arg(long = "ssh-arg", allow_hyphen_values = true)]
    pub(crate) ssh_args: Vec<String>,
    #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
    pub(crate) backoff_min: Duration,
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    pub(crate) backoff_max: Duration,
    #[arg(long, default_value_t = 8)]
    pub(crate) backoff_attempts: u32,
    /// Tunnel endpoint for projects without a docker_host.
    #[arg(long, default_value = DEFAULT_REMOTE_SOCKET_ADDR)]
    pub(crate) remote_socket_addr: String,
    #[arg(long, default_value = DEFAULT_COMPOSE_BIN)]
    pub(crate) compose_bin: String,
    /// Holds the askpass helper and the ssh forward sockets.
    #[arg(long, default_value = "~/.compose-hosts")]
    pub(crate) state_dir: String,
    /// Passed to the compose command after `-f` and `--project-name`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

impl Args {
    /// `None` disables logging entirely.
    pub(crate) fn log_filter(&self) -> Option<&'static str> {
        if self.logs_off {
            None
        } else if self.logs_verbose {
            Some("debug")
        } else {
            Some("info")
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        if self.parallel {
            Mode::Concurrent
        } else {
            Mode::Serial
        }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            min: self.backoff_min,
            max: self.backoff_max,
            attempts: self.backoff_attempts,
        }
    }

    pub(crate) fn ssh_client(&self) -> SshClient {
        SshClient {
            program: self.ssh_bin.clone(),
            extra_args: self.ssh_args.clone(),
            state_dir: expand_home(&self.state_dir),
        }
    }

    pub(crate) fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            agent_addr: self.ssh_agent_addr.clone(),
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            remote_socket_addr: self.remote_socket_addr.clone(),
        }
    }
}

/// Replaces a leading `~` with `$HOME`; `~user` forms are left alone.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    let home = || std::env::var_os("HOME").map(PathBuf::from);
    match path.strip_prefix('~') {
        Some("") => home().unwrap_or_else(|| PathBuf::from(path)),
        Some(rest) if rest.starts_with('/') => match home() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}
