use crate::env::Env;
use crate::gateway::{Gateway, GatewaySettings};
use crate::runner::TargetRunner;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunnel_manager::{
    LocalEndpoint, RemoteEndpoint, SshTunnelSpec, Tunnel, TunnelFailure, TunnelTransport,
};

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!("compose-hosts-{prefix}-{nanos}-{seq}"));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Writes a control file meant to be run as `sh -f <file> --project-name <name> ...`.
pub(crate) fn write_compose_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("compose.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write compose script");
    path
}

pub(crate) fn env(pairs: &[(&str, &str)]) -> Arc<dyn Env> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(map)
}

pub(crate) fn gateway_settings() -> GatewaySettings {
    GatewaySettings {
        agent_addr: "$SSH_AUTH_SOCK".to_string(),
        known_hosts_file: None,
        remote_socket_addr: "unix:///var/run/docker.sock".to_string(),
    }
}

pub(crate) fn runner(transport: Arc<dyn TunnelTransport>, env: Arc<dyn Env>) -> TargetRunner {
    let gateway = Gateway::new(transport, gateway_settings(), Arc::clone(&env));
    TargetRunner::new("sh".to_string(), gateway, env)
}

/// Hands out tunnels on a fixed local address and records every call.
pub(crate) struct FakeTransport {
    local: LocalEndpoint,
    calls: AtomicUsize,
    early_failure: Option<String>,
    pub(crate) requests: Mutex<Vec<(SshTunnelSpec, RemoteEndpoint)>>,
    pub(crate) scopes: Mutex<Vec<CancellationToken>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<TunnelFailure>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            local: LocalEndpoint::new("127.0.0.1:4242".parse().unwrap()),
            calls: AtomicUsize::new(0),
            early_failure: None,
            requests: Mutex::new(Vec::new()),
            scopes: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Every tunnel reports `message` right after it is handed out.
    pub(crate) fn with_early_failure(mut self, message: &str) -> Self {
        self.early_failure = Some(message.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn establish(
        &self,
        spec: &SshTunnelSpec,
        remote: &RemoteEndpoint,
        cancel: CancellationToken,
    ) -> anyhow::Result<Tunnel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((spec.clone(), remote.clone()));
        let scope = cancel.child_token();
        self.scopes.lock().unwrap().push(scope.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(message) = self.early_failure.as_ref() {
            tx.send(TunnelFailure {
                attempt: 1,
                message: message.clone(),
            })
            .unwrap();
        }
        // keep the stream open like a live supervisor would
        self.senders.lock().unwrap().push(tx);
        Ok(Tunnel::new(self.local, rx, scope))
    }
}

/// Fails every establish call without handing out a tunnel.
pub(crate) struct FailingTransport {
    calls: AtomicUsize,
}

impl FailingTransport {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelTransport for FailingTransport {
    async fn establish(
        &self,
        _spec: &SshTunnelSpec,
        _remote: &RemoteEndpoint,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Tunnel> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("Permission denied (publickey)")
    }
}

/// Panics inside establish, taking the calling task down with it.
pub(crate) struct PanickingTransport;

#[async_trait]
impl TunnelTransport for PanickingTransport {
    async fn establish(
        &self,
        spec: &SshTunnelSpec,
        _remote: &RemoteEndpoint,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Tunnel> {
        panic!("transport exploded for {}", spec.host);
    }
}
