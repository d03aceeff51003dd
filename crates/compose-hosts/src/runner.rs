use crate::config::Target;
use crate::env::{expand, Env};
use crate::error::RunError;
use crate::gateway::Gateway;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_manager::Tunnel;

pub(crate) const DEFAULT_COMPOSE_BIN: &str = "docker-compose";
pub(crate) const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Runs the control command for a single target.
pub(crate) struct TargetRunner {
    compose_bin: String,
    gateway: Gateway,
    env: Arc<dyn Env>,
}

impl TargetRunner {
    pub(crate) fn new(compose_bin: String, gateway: Gateway, env: Arc<dyn Env>) -> Self {
        Self {
            compose_bin,
            gateway,
            env,
        }
    }

    pub(crate) async fn run(&self, target: &Target, extra_args: &[String]) -> Result<(), RunError> {
        let mut docker_host =
            expand(&target.docker_host, self.env.as_ref()).map_err(RunError::Resolve)?;

        let scope = CancellationToken::new();
        let _scope_guard = scope.clone().drop_guard();

        let mut tunnel = self
            .gateway
            .establish(target.tunnel.as_ref(), &docker_host, &scope)
            .await?;
        if let Some(tunnel) = tunnel.as_ref() {
            docker_host = tunnel.local().url();
        }

        let outcome = self
            .execute(target, extra_args, &docker_host, tunnel.as_mut())
            .await;
        scope.cancel();
        if let Some(tunnel) = tunnel {
            tunnel.shutdown().await;
        }
        outcome
    }

    async fn execute(
        &self,
        target: &Target,
        extra_args: &[String],
        docker_host: &str,
        tunnel: Option<&mut Tunnel>,
    ) -> Result<(), RunError> {
        let mut cmd = self.command(target, extra_args, docker_host);
        debug!(
            event = "compose.exec",
            target_name = %target.name,
            dir = %working_dir(&target.compose_file).display(),
            program = %self.compose_bin,
            args = ?cmd.as_std().get_args().collect::<Vec<_>>(),
            "running control command"
        );
        let mut child = cmd.spawn().map_err(|source| RunError::Launch {
            program: self.compose_bin.clone(),
            source,
        })?;
        let status = wait_child(&mut child, tunnel, &target.name)
            .await
            .map_err(|source| RunError::Wait {
                program: self.compose_bin.clone(),
                source,
            })?;
        if status.success() {
            info!(event = "compose.done", target_name = %target.name, "control command finished");
            Ok(())
        } else {
            Err(RunError::Exit {
                code: status.code(),
            })
        }
    }

    fn command(&self, target: &Target, extra_args: &[String], docker_host: &str) -> Command {
        let file_name = target
            .compose_file
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| target.compose_file.clone().into_os_string());
        let mut cmd = Command::new(&self.compose_bin);
        cmd.arg("-f")
            .arg(file_name)
            .arg("--project-name")
            .arg(&target.name)
            .args(extra_args)
            .current_dir(working_dir(&target.compose_file));
        if !docker_host.is_empty() {
            cmd.env(DOCKER_HOST_ENV, docker_host);
        }
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

fn working_dir(compose_file: &Path) -> PathBuf {
    match compose_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Waits for the child; tunnel failures are only logged meanwhile.
async fn wait_child(
    child: &mut Child,
    tunnel: Option<&mut Tunnel>,
    target_name: &str,
) -> std::io::Result<ExitStatus> {
    let Some(tunnel) = tunnel else {
        return child.wait().await;
    };
    let mut reporting = true;
    loop {
        tokio::select! {
            status = child.wait() => return status,
            failure = tunnel.next_failure(), if reporting => match failure {
                Some(failure) => warn!(
                    event = "tunnel.failure",
                    target_name = %target_name,
                    error = %failure,
                    "tunnel failure, waiting for control command"
                ),
                None => reporting = false,
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{SshProfile, TunnelProfile};
    use crate::error::EstablishError;
    use crate::test_utils::{
        env, runner, temp_dir, write_compose_script, FailingTransport, FakeTransport,
    };

    fn target(name: &str, compose_file: PathBuf, docker_host: &str) -> Target {
        Target {
            name: name.to_string(),
            docker_host: docker_host.to_string(),
            tunnel: None,
            compose_file,
        }
    }

    fn ssh_profile() -> TunnelProfile {
        TunnelProfile::Ssh(SshProfile {
            host: "bastion".to_string(),
            host_key_file: None,
            use_agent: false,
            user: "deploy".to_string(),
            password: None,
            key_file: None,
            key_passphrase: None,
        })
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn passes_file_project_and_extra_args_from_compose_dir() {
        let dir = temp_dir("runner-args");
        let file = write_compose_script(
            &dir,
            "pwd -P > args.txt; printf '%s\\n' \"$@\" >> args.txt",
        );
        let runner = runner(Arc::new(FakeTransport::new()), env(&[]));
        let extra = vec!["up".to_string(), "-d".to_string()];
        runner.run(&target("web", file, ""), &extra).await.unwrap();

        let expected_dir = dir.canonicalize().unwrap();
        assert_eq!(
            read(dir.join("args.txt")),
            format!("{}\n--project-name\nweb\nup\n-d\n", expected_dir.display())
        );
    }

    #[tokio::test]
    async fn direct_address_without_tunnel_profile() {
        let dir = temp_dir("runner-direct");
        let file = write_compose_script(&dir, "printf '%s' \"$DOCKER_HOST\" > host.txt");
        let transport = Arc::new(FakeTransport::new());
        let runner = runner(transport.clone(), env(&[("REMOTE", "10.0.0.5")]));
        runner
            .run(&target("web", file, "tcp://$REMOTE:2375"), &[])
            .await
            .unwrap();
        assert_eq!(read(dir.join("host.txt")), "tcp://10.0.0.5:2375");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn tunnel_address_replaces_direct_address() {
        let dir = temp_dir("runner-tunnel");
        let file = write_compose_script(&dir, "printf '%s' \"$DOCKER_HOST\" > host.txt");
        let transport = Arc::new(FakeTransport::new());
        let runner = runner(transport.clone(), env(&[]));
        let mut target = target("web", file, "unix:///var/run/docker.sock");
        target.tunnel = Some(ssh_profile());
        runner.run(&target, &[]).await.unwrap();

        assert_eq!(read(dir.join("host.txt")), "tcp://127.0.0.1:4242");
        assert_eq!(transport.calls(), 1);
        let scopes = transport.scopes.lock().unwrap();
        assert!(scopes[0].is_cancelled());
    }

    #[tokio::test]
    async fn transient_tunnel_failure_does_not_fail_run() {
        let dir = temp_dir("runner-transient");
        let file = write_compose_script(&dir, "sleep 0.2; touch done");
        let transport =
            Arc::new(FakeTransport::new().with_early_failure("connection reset by peer"));
        let runner = runner(transport.clone(), env(&[]));
        let mut target = target("web", file, "");
        target.tunnel = Some(ssh_profile());
        runner.run(&target, &[]).await.unwrap();
        assert!(dir.join("done").exists());
    }

    #[tokio::test]
    async fn exit_status_wins_over_tunnel_failures() {
        let dir = temp_dir("runner-event-exit");
        let file = write_compose_script(&dir, "sleep 0.1; exit 9");
        let transport = Arc::new(FakeTransport::new().with_early_failure("broken pipe"));
        let runner = runner(transport, env(&[]));
        let mut target = target("web", file, "");
        target.tunnel = Some(ssh_profile());
        let err = runner.run(&target, &[]).await.unwrap_err();
        assert!(matches!(err, RunError::Exit { code: Some(9) }));
    }

    fn docker_host_override(cmd: &Command) -> Option<Option<String>> {
        cmd.as_std()
            .get_envs()
            .find(|(key, _)| *key == DOCKER_HOST_ENV)
            .map(|(_, value)| value.map(|value| value.to_string_lossy().to_string()))
    }

    #[test]
    fn docker_host_only_overrides_inherited_value_when_set() {
        let runner = runner(Arc::new(FakeTransport::new()), env(&[]));
        let target = target("web", PathBuf::from("/srv/web/compose.yml"), "");

        let cmd = runner.command(&target, &[], "tcp://10.0.0.5:2375");
        assert_eq!(
            docker_host_override(&cmd),
            Some(Some("tcp://10.0.0.5:2375".to_string()))
        );

        let cmd = runner.command(&target, &[], "");
        assert_eq!(docker_host_override(&cmd), None);
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/srv/web")));
    }

    #[tokio::test]
    async fn failed_establish_never_launches_command() {
        let dir = temp_dir("runner-establish");
        let file = write_compose_script(&dir, "touch launched");
        let transport = Arc::new(FailingTransport::new());
        let runner = runner(transport.clone(), env(&[]));
        let mut target = target("web", file, "");
        target.tunnel = Some(ssh_profile());
        let err = runner.run(&target, &[]).await.unwrap_err();
        assert!(matches!(err, RunError::Establish(EstablishError::Transport(_))));
        assert!(!dir.join("launched").exists());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unresolved_docker_host_fails_before_anything_runs() {
        let dir = temp_dir("runner-resolve");
        let file = write_compose_script(&dir, "touch launched");
        let transport = Arc::new(FakeTransport::new());
        let runner = runner(transport.clone(), env(&[]));
        let mut target = target("web", file, "tcp://$DOCKER_REMOTE:2375");
        target.tunnel = Some(ssh_profile());
        let err = runner.run(&target, &[]).await.unwrap_err();
        match err {
            RunError::Resolve(err) => assert_eq!(err.names, vec!["DOCKER_REMOTE".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.join("launched").exists());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code() {
        let dir = temp_dir("runner-exit");
        let file = write_compose_script(&dir, "exit 7");
        let runner = runner(Arc::new(FakeTransport::new()), env(&[]));
        let err = runner.run(&target("web", file, ""), &[]).await.unwrap_err();
        assert!(matches!(err, RunError::Exit { code: Some(7) }));
        assert_eq!(err.to_string(), "exit status 7");
    }

    #[tokio::test]
    async fn missing_control_binary_is_a_launch_error() {
        let dir = temp_dir("runner-launch");
        let file = write_compose_script(&dir, "exit 0");
        let env = env(&[]);
        let gateway = Gateway::new(
            Arc::new(FakeTransport::new()),
            crate::test_utils::gateway_settings(),
            Arc::clone(&env),
        );
        let runner = TargetRunner::new("/nonexistent/docker-compose".to_string(), gateway, env);
        let err = runner.run(&target("web", file, ""), &[]).await.unwrap_err();
        assert!(matches!(err, RunError::Launch { .. }));
    }

    #[tokio::test]
    async fn repeated_runs_establish_independent_tunnels() {
        let dir = temp_dir("runner-repeat");
        let file = write_compose_script(&dir, "exit 0");
        let transport = Arc::new(FakeTransport::new());
        let runner = runner(transport.clone(), env(&[]));
        let mut target = target("web", file, "");
        target.tunnel = Some(ssh_profile());
        runner.run(&target, &[]).await.unwrap();
        runner.run(&target, &[]).await.unwrap();
        assert_eq!(transport.calls(), 2);
        let scopes = transport.scopes.lock().unwrap();
        assert!(scopes.iter().all(CancellationToken::is_cancelled));
    }
}
