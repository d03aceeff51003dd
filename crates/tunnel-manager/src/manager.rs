use crate::backoff::Backoff;
use crate::ssh::{LocalEndpoint, RemoteEndpoint, SshClient, SshTunnelSpec};
use crate::tunnel::{Tunnel, TunnelFailure, TunnelTransport};
use anyhow::Context;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use system_utils::process::{terminate_child, TERMINATE_GRACE};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Serves each tunnel on an in-process loopback listener and relays accepted
/// connections to a socket owned by an external ssh client, restarting the
/// client when it exits.
pub struct ExternalSshTransport {
    client: SshClient,
    backoff: Backoff,
}

impl ExternalSshTransport {
    pub fn new(client: SshClient, backoff: Backoff) -> Self {
        Self { client, backoff }
    }
}

#[async_trait]
impl TunnelTransport for ExternalSshTransport {
    async fn establish(
        &self,
        spec: &SshTunnelSpec,
        remote: &RemoteEndpoint,
        cancel: CancellationToken,
    ) -> anyhow::Result<Tunnel> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("failed to bind a local tunnel port")?;
        let local = listener
            .local_addr()
            .context("failed to read local tunnel port")?;
        let socket = self.client.forward_socket(local.port());
        if let Some(dir) = socket.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        info!(
            event = "tunnel.open",
            destination = %spec.destination(),
            remote = %remote,
            local = %local,
            socket = %socket.display(),
            "opening ssh tunnel"
        );
        let client = self.client.clone();
        let spec = spec.clone();
        let remote = remote.clone();
        let forward = socket.clone();
        let launcher = move || client.forward_command(&spec, &forward, &remote);
        open_tunnel(launcher, listener, socket, self.backoff, cancel).await
    }
}

/// Whether the ssh-owned socket behind the listener can take connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Leg {
    Connecting,
    Ready,
    Stopped,
}

pub(crate) async fn open_tunnel<F>(
    launcher: F,
    listener: TcpListener,
    socket: PathBuf,
    backoff: Backoff,
    cancel: CancellationToken,
) -> anyhow::Result<Tunnel>
where
    F: Fn() -> anyhow::Result<Command> + Send + Sync + 'static,
{
    let local = listener
        .local_addr()
        .context("failed to read local tunnel port")?;
    let cancel = cancel.child_token();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    let (leg_tx, leg_rx) = watch::channel(Leg::Connecting);
    let scope = cancel.clone();
    let supervisor = tokio::spawn(async move {
        let relay = serve_connections(listener, socket.clone(), leg_rx, scope.clone());
        let attempts = supervise(
            &launcher, local, &socket, backoff, &scope, ready_tx, failure_tx, leg_tx,
        );
        tokio::join!(relay, attempts);
        let _ = tokio::fs::remove_file(&socket).await;
    });
    let tunnel =
        Tunnel::new(LocalEndpoint::new(local), failure_rx, cancel).with_supervisor(supervisor);
    match ready_rx.await {
        Ok(Ok(())) => Ok(tunnel),
        Ok(Err(err)) => {
            tunnel.shutdown().await;
            Err(err)
        }
        Err(_) => {
            tunnel.shutdown().await;
            anyhow::bail!("tunnel to {local} cancelled before it was ready")
        }
    }
}

/// Accepts on the loopback listener until the tunnel is cancelled; ssh
/// restarts never close it.
async fn serve_connections(
    listener: TcpListener,
    socket: PathBuf,
    leg: watch::Receiver<Leg>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    debug!(event = "tunnel.accept", peer = %peer);
                    tokio::spawn(relay(inbound, socket.clone(), leg.clone(), cancel.clone()));
                }
                Err(err) => {
                    warn!(
                        event = "tunnel.accept_failed",
                        error = %err,
                        "failed to accept tunnel connection"
                    );
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
}

async fn relay(
    mut inbound: TcpStream,
    socket: PathBuf,
    mut leg: watch::Receiver<Leg>,
    cancel: CancellationToken,
) {
    let ready = tokio::select! {
        _ = cancel.cancelled() => return,
        ready = leg_ready(&mut leg) => ready,
    };
    if !ready {
        debug!(event = "tunnel.relay_dropped", "ssh stopped, dropping connection");
        return;
    }
    let mut outbound = match UnixStream::connect(&socket).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(event = "tunnel.relay_failed", error = %err, "failed to reach ssh forward");
            return;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {
            if let Err(err) = copied {
                debug!(event = "tunnel.relay_closed", error = %err);
            }
        }
    }
}

/// Waits while ssh reconnects; `false` once it has stopped for good.
async fn leg_ready(leg: &mut watch::Receiver<Leg>) -> bool {
    loop {
        let current = *leg.borrow_and_update();
        match current {
            Leg::Ready => return true,
            Leg::Stopped => return false,
            Leg::Connecting => {}
        }
        if leg.changed().await.is_err() {
            return false;
        }
    }
}

enum AttemptOutcome {
    Cancelled,
    Failed {
        error: anyhow::Error,
        was_ready: bool,
    },
}

#[allow(clippy::too_many_arguments)]
async fn supervise<F>(
    launcher: &F,
    local: SocketAddr,
    socket: &Path,
    backoff: Backoff,
    cancel: &CancellationToken,
    ready_tx: oneshot::Sender<anyhow::Result<()>>,
    failures: mpsc::UnboundedSender<TunnelFailure>,
    leg: watch::Sender<Leg>,
) where
    F: Fn() -> anyhow::Result<Command>,
{
    let mut ready = Some(ready_tx);
    let limit = backoff.limit();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = run_attempt(launcher, local, socket, cancel, &mut ready, &leg).await;
        let (error, was_ready) = match outcome {
            AttemptOutcome::Cancelled => {
                leg.send_replace(Leg::Stopped);
                return;
            }
            AttemptOutcome::Failed { error, was_ready } => (error, was_ready),
        };
        leg.send_replace(Leg::Connecting);
        if was_ready {
            attempt = 1;
        }
        let message = format!("{error:#}");
        warn!(
            event = "tunnel.attempt_failed",
            local = %local,
            attempt,
            error = %message,
            "ssh tunnel attempt failed"
        );
        let _ = failures.send(TunnelFailure { attempt, message });
        if attempt >= limit {
            leg.send_replace(Leg::Stopped);
            match ready.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error.context(format!(
                        "ssh tunnel not established after {attempt} attempts"
                    ))));
                }
                None => {
                    let _ = failures.send(TunnelFailure {
                        attempt,
                        message: format!("giving up after {attempt} attempts"),
                    });
                }
            }
            return;
        }
        let delay = backoff.delay(attempt);
        debug!(event = "tunnel.backoff", local = %local, delay_ms = delay.as_millis() as u64);
        tokio::select! {
            _ = cancel.cancelled() => {
                leg.send_replace(Leg::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt<F>(
    launcher: &F,
    local: SocketAddr,
    socket: &Path,
    cancel: &CancellationToken,
    ready: &mut Option<oneshot::Sender<anyhow::Result<()>>>,
    leg: &watch::Sender<Leg>,
) -> AttemptOutcome
where
    F: Fn() -> anyhow::Result<Command>,
{
    let spawned = launcher().and_then(|mut cmd| cmd.spawn().context("failed to spawn ssh"));
    let mut child = match spawned {
        Ok(child) => child,
        Err(error) => {
            return AttemptOutcome::Failed {
                error,
                was_ready: false,
            }
        }
    };
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(collect_stderr(pipe)));

    let started = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate_child(&mut child, TERMINATE_GRACE).await;
                return AttemptOutcome::Cancelled;
            }
            status = child.wait() => {
                return AttemptOutcome::Failed {
                    error: exit_error(status, stderr).await,
                    was_ready: false,
                };
            }
            _ = tokio::time::sleep(READY_POLL_INTERVAL) => {
                if UnixStream::connect(socket).await.is_ok() {
                    break;
                }
                if started.elapsed() >= READY_TIMEOUT {
                    terminate_child(&mut child, TERMINATE_GRACE).await;
                    return AttemptOutcome::Failed {
                        error: anyhow::anyhow!(
                            "ssh forward {} not ready after {}s",
                            socket.display(),
                            READY_TIMEOUT.as_secs()
                        ),
                        was_ready: false,
                    };
                }
            }
        }
    }

    info!(event = "tunnel.ready", local = %local, "ssh tunnel ready");
    leg.send_replace(Leg::Ready);
    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }

    wait_established(&mut child, stderr, cancel).await
}

async fn wait_established(
    child: &mut Child,
    stderr: Option<JoinHandle<Option<String>>>,
    cancel: &CancellationToken,
) -> AttemptOutcome {
    tokio::select! {
        _ = cancel.cancelled() => {
            terminate_child(child, TERMINATE_GRACE).await;
            AttemptOutcome::Cancelled
        }
        status = child.wait() => AttemptOutcome::Failed {
            error: exit_error(status, stderr).await,
            was_ready: true,
        },
    }
}

async fn exit_error(
    status: std::io::Result<std::process::ExitStatus>,
    stderr: Option<JoinHandle<Option<String>>>,
) -> anyhow::Error {
    let status = match status {
        Ok(status) => status,
        Err(err) => return anyhow::Error::new(err).context("failed to wait for ssh"),
    };
    let detail = match stderr {
        Some(handle) => handle.await.ok().flatten(),
        None => None,
    };
    match detail {
        Some(detail) => anyhow::anyhow!("ssh exited with {status}: {detail}"),
        None => anyhow::anyhow!("ssh exited with {status}"),
    }
}

async fn collect_stderr(pipe: ChildStderr) -> Option<String> {
    let mut lines = BufReader::new(pipe).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(event = "tunnel.ssh_stderr", line = %line);
        last = Some(line.to_string());
    }
    last
}
