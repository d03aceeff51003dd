use crate::config::{SshProfile, TunnelProfile};
use crate::env::{expand, Env};
use crate::error::EstablishError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tunnel_manager::{
    split_ssh_host, RemoteEndpoint, SshAuth, SshKey, SshTunnelSpec, Tunnel, TunnelTransport,
};

pub(crate) const DEFAULT_REMOTE_SOCKET_ADDR: &str = "unix:///var/run/docker.sock";
pub(crate) const DEFAULT_AGENT_ADDR: &str = "$SSH_AUTH_SOCK";

/// Tunnel options that apply to every target.
#[derive(Clone, Debug)]
pub(crate) struct GatewaySettings {
    /// Agent socket template, expanded only for profiles that use the agent.
    pub(crate) agent_addr: String,
    /// Used when a profile names no host key file of its own.
    pub(crate) known_hosts_file: Option<String>,
    /// Remote endpoint for targets without a docker host address.
    pub(crate) remote_socket_addr: String,
}

/// Turns a target's tunnel profile into an open tunnel.
pub(crate) struct Gateway {
    transport: Arc<dyn TunnelTransport>,
    settings: GatewaySettings,
    env: Arc<dyn Env>,
}

impl Gateway {
    pub(crate) fn new(
        transport: Arc<dyn TunnelTransport>,
        settings: GatewaySettings,
        env: Arc<dyn Env>,
    ) -> Self {
        Self {
            transport,
            settings,
            env,
        }
    }

    /// Returns `Ok(None)` without touching the transport when `profile` is absent.
    ///
    /// The tunnel is bound to a child of `scope` and closes when `scope` is cancelled.
    pub(crate) async fn establish(
        &self,
        profile: Option<&TunnelProfile>,
        target_address: &str,
        scope: &CancellationToken,
    ) -> Result<Option<Tunnel>, EstablishError> {
        let Some(profile) = profile else {
            return Ok(None);
        };
        let spec = match profile {
            TunnelProfile::Ssh(ssh) => self.ssh_spec(ssh)?,
        };
        let remote = self.remote_endpoint(target_address)?;
        let tunnel = self
            .transport
            .establish(&spec, &remote, scope.child_token())
            .await
            .map_err(EstablishError::Transport)?;
        tracing::info!(
            event = "tunnel.established",
            destination = %spec.destination(),
            remote = %remote,
            local = %tunnel.local(),
            "tunnel established"
        );
        Ok(Some(tunnel))
    }

    fn ssh_spec(&self, ssh: &SshProfile) -> Result<SshTunnelSpec, EstablishError> {
        let (host, port) = split_ssh_host(&self.resolve("host", &ssh.host)?);
        let user = self.resolve("user", &ssh.user)?;
        let known_hosts_file = ssh
            .host_key_file
            .as_deref()
            .or(self.settings.known_hosts_file.as_deref())
            .map(|file| self.resolve("host_key_file", file).map(PathBuf::from))
            .transpose()?;
        let agent_addr = if ssh.use_agent {
            Some(PathBuf::from(
                self.resolve("agent address", &self.settings.agent_addr)?,
            ))
        } else {
            None
        };
        let password = ssh
            .password
            .as_deref()
            .map(|password| self.resolve("password", password))
            .transpose()?;
        let key = match ssh.key_file.as_deref() {
            Some(path) => Some(SshKey {
                path: PathBuf::from(self.resolve("key_file", path)?),
                passphrase: ssh
                    .key_passphrase
                    .as_deref()
                    .map(|passphrase| self.resolve("key_passphrase", passphrase))
                    .transpose()?,
            }),
            None => None,
        };
        Ok(SshTunnelSpec {
            host,
            port,
            user,
            known_hosts_file,
            auth: SshAuth {
                agent_addr,
                password,
                key,
            },
        })
    }

    fn remote_endpoint(&self, target_address: &str) -> Result<RemoteEndpoint, EstablishError> {
        let addr = if target_address.is_empty() {
            self.settings.remote_socket_addr.as_str()
        } else {
            target_address
        };
        RemoteEndpoint::parse(addr).map_err(|err| EstablishError::Address {
            addr: addr.to_string(),
            reason: format!("{err:#}"),
        })
    }

    fn resolve(&self, field: &'static str, template: &str) -> Result<String, EstablishError> {
        expand(template, self.env.as_ref())
            .map_err(|source| EstablishError::Resolve { field, source })
    }
}
