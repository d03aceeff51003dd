//! SSH local-forward tunnels driven through an external `ssh` client.
//!
//! A [`TunnelTransport`] turns an [`SshTunnelSpec`] and a [`RemoteEndpoint`]
//! into a [`Tunnel`]: a loopback listener owned by this process that relays
//! to the remote side, plus a stream of [`TunnelFailure`] events reported
//! while the ssh client is restarted in the background. The listener stays
//! bound across restarts. Forward sockets are unix domain sockets, so the
//! transport is unix only.

mod backoff;
mod manager;
mod ssh;
mod tunnel;

pub use backoff::Backoff;
pub use manager::ExternalSshTransport;
pub use ssh::{
    split_ssh_host, LocalEndpoint, RemoteEndpoint, SshAuth, SshClient, SshKey, SshTunnelSpec,
};
pub use tunnel::{Tunnel, TunnelFailure, TunnelTransport};
