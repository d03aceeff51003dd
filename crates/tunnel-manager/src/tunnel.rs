use crate::ssh::{LocalEndpoint, RemoteEndpoint, SshTunnelSpec};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A failed connection attempt or a dropped session.
///
/// The tunnel keeps reconnecting after reporting one, so it is not
/// necessarily fatal for connections made later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelFailure {
    pub attempt: u32,
    pub message: String,
}

impl fmt::Display for TunnelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {}: {}", self.attempt, self.message)
    }
}

/// An established local forward.
///
/// Dropping the handle cancels the tunnel; [`Tunnel::shutdown`] also waits
/// until the ssh client has been released.
#[derive(Debug)]
pub struct Tunnel {
    local: LocalEndpoint,
    failures: mpsc::UnboundedReceiver<TunnelFailure>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl Tunnel {
    pub fn new(
        local: LocalEndpoint,
        failures: mpsc::UnboundedReceiver<TunnelFailure>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local,
            failures,
            cancel,
            supervisor: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: JoinHandle<()>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn local(&self) -> &LocalEndpoint {
        &self.local
    }

    /// Next failure event; `None` once the transport has stopped reporting.
    pub async fn next_failure(&mut self) -> Option<TunnelFailure> {
        self.failures.recv().await
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                tracing::warn!(error = %err, local = %self.local, "tunnel supervisor failed");
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens tunnels; implemented by the external ssh client transport.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Forwards a loopback listener to `remote` through the ssh server in `spec`.
    ///
    /// The tunnel lives until `cancel` fires or the returned handle is dropped.
    async fn establish(
        &self,
        spec: &SshTunnelSpec,
        remote: &RemoteEndpoint,
        cancel: CancellationToken,
    ) -> anyhow::Result<Tunnel>;
}
