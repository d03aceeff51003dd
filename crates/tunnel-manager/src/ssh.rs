use anyhow::Context;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use system_utils::ssh::{apply_askpass_env, AskpassSecrets};
use tokio::process::Command;

const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const SSH_AUTH_SOCK_ENV: &str = "SSH_AUTH_SOCK";
const FORWARD_SOCKET_DIR: &str = "tunnels";

/// Connection settings for one ssh session, with every placeholder already expanded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTunnelSpec {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub known_hosts_file: Option<PathBuf>,
    pub auth: SshAuth,
}

impl SshTunnelSpec {
    pub fn destination(&self) -> String {
        let host = if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        };
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }
}

/// Authentication candidates; the ssh client tries whichever are present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SshAuth {
    pub agent_addr: Option<PathBuf>,
    pub password: Option<String>,
    pub key: Option<SshKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshKey {
    pub path: PathBuf,
    pub passphrase: Option<String>,
}

impl SshAuth {
    pub fn is_empty(&self) -> bool {
        self.agent_addr.is_none() && self.password.is_none() && self.key.is_none()
    }

    fn preferred_authentications(&self) -> Option<String> {
        let mut methods = Vec::new();
        if self.agent_addr.is_some() || self.key.is_some() {
            methods.push("publickey");
        }
        if self.password.is_some() {
            methods.push("password");
            methods.push("keyboard-interactive");
        }
        if methods.is_empty() {
            None
        } else {
            Some(methods.join(","))
        }
    }

    fn askpass_secrets(&self) -> AskpassSecrets {
        AskpassSecrets {
            password: self.password.clone(),
            passphrase: self.key.as_ref().and_then(|key| key.passphrase.clone()),
        }
    }
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_ssh_host(raw: &str) -> (String, Option<u16>) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|port| port.parse().ok());
            return (host.to_string(), port);
        }
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (raw.to_string(), None),
        },
        _ => (raw.to_string(), None),
    }
}

/// Where forwarded connections end up on the ssh server's side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteEndpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl RemoteEndpoint {
    /// Parses `unix:///path`, `tcp://host:port`, `/path` or `host:port`.
    pub fn parse(addr: &str) -> anyhow::Result<Self> {
        if let Some(path) = addr.strip_prefix("unix://") {
            if path.is_empty() {
                anyhow::bail!("invalid address {addr}, missing socket path");
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if addr.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(addr)));
        }
        let host_port = match addr.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => anyhow::bail!("unsupported scheme {scheme} in address {addr}"),
            None => addr,
        };
        let (host, port) = parse_host_port(host_port)?;
        Ok(Self::Tcp { host, port })
    }

    fn forward_target(&self) -> String {
        match self {
            Self::Tcp { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Self::Tcp { host, port } => format!("{host}:{port}"),
            Self::Unix(path) => path.display().to_string(),
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { .. } => write!(f, "tcp://{}", self.forward_target()),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Loopback address a tunnel listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalEndpoint(SocketAddr);

impl LocalEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// Connection string in `scheme://host:port` form.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.0)
    }
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// The external ssh client binary and the options shared by every tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshClient {
    pub program: String,
    pub extra_args: Vec<String>,
    /// Directory holding the askpass helper and the forward sockets.
    pub state_dir: PathBuf,
}

impl SshClient {
    /// Socket ssh listens on for the tunnel served on loopback `port`.
    pub(crate) fn forward_socket(&self, port: u16) -> PathBuf {
        self.state_dir
            .join(FORWARD_SOCKET_DIR)
            .join(format!("{}-{port}.sock", std::process::id()))
    }

    pub(crate) fn forward_command(
        &self,
        spec: &SshTunnelSpec,
        socket: &Path,
        remote: &RemoteEndpoint,
    ) -> anyhow::Result<Command> {
        let mut cmd = Command::new(&self.program);
        let secrets = spec.auth.askpass_secrets();
        if !secrets.is_empty() {
            apply_askpass_env(&mut cmd, &self.state_dir, &secrets)
                .context("failed to prepare ssh askpass helper")?;
        }
        match spec.auth.agent_addr.as_ref() {
            Some(addr) => {
                cmd.env(SSH_AUTH_SOCK_ENV, addr);
            }
            None => {
                cmd.env_remove(SSH_AUTH_SOCK_ENV);
            }
        }
        cmd.arg("-N")
            .arg("-T")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS))
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-o")
            .arg("StreamLocalBindUnlink=yes");
        match spec.known_hosts_file.as_ref() {
            Some(file) => {
                cmd.arg("-o")
                    .arg(format!("UserKnownHostsFile={}", file.display()))
                    .arg("-o")
                    .arg("StrictHostKeyChecking=yes");
            }
            None => {
                cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
            }
        }
        if spec.auth.agent_addr.is_none() {
            cmd.arg("-o").arg("IdentityAgent=none");
        }
        if let Some(key) = spec.auth.key.as_ref() {
            cmd.arg("-i").arg(&key.path);
        }
        if secrets.is_empty() {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        if let Some(methods) = spec.auth.preferred_authentications() {
            cmd.arg("-o").arg(format!("PreferredAuthentications={methods}"));
        }
        if let Some(port) = spec.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if !spec.user.is_empty() {
            cmd.arg("-l").arg(&spec.user);
        }
        cmd.arg("-L")
            .arg(format!("{}:{}", socket.display(), remote.forward_target()));
        if !self.extra_args.is_empty() {
            cmd.args(&self.extra_args);
        }
        cmd.arg(&spec.host);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

fn parse_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid address {addr}, expected host:port"))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in address {addr}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
