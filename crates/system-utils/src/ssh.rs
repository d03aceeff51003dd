use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;

pub const ASKPASS_PASSWORD_ENV: &str = "COMPOSE_HOSTS_SSH_PASS";
pub const ASKPASS_PASSPHRASE_ENV: &str = "COMPOSE_HOSTS_SSH_PASSPHRASE";

const ASKPASS_FILE_NAME: &str = "ssh-askpass.sh";

static STAGING_SEQ: AtomicUsize = AtomicUsize::new(0);

// ssh passes the prompt as $1; key prompts mention the passphrase.
const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  *assphrase*) printf '%s' "$COMPOSE_HOSTS_SSH_PASSPHRASE" ;;
  *) printf '%s' "$COMPOSE_HOSTS_SSH_PASS" ;;
esac
"#;

/// Secrets answered by the askpass helper.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AskpassSecrets {
    pub password: Option<String>,
    pub passphrase: Option<String>,
}

impl AskpassSecrets {
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.passphrase.is_none()
    }
}

pub fn askpass_env(
    state_dir: &Path,
    secrets: &AskpassSecrets,
) -> anyhow::Result<Vec<(String, String)>> {
    let script = ensure_askpass_script(state_dir)?;
    let mut env = vec![
        ("SSH_ASKPASS".to_string(), script.to_string_lossy().to_string()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
        ("DISPLAY".to_string(), "1".to_string()),
    ];
    if let Some(password) = secrets.password.as_ref() {
        env.push((ASKPASS_PASSWORD_ENV.to_string(), password.clone()));
    }
    if let Some(passphrase) = secrets.passphrase.as_ref() {
        env.push((ASKPASS_PASSPHRASE_ENV.to_string(), passphrase.clone()));
    }
    Ok(env)
}

/// Writes the helper into `state_dir` unless an identical copy is there.
///
/// The script is staged under a unique name and renamed into place, so a
/// concurrent ssh never executes a partially written file.
pub fn ensure_askpass_script(state_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let path = state_dir.join(ASKPASS_FILE_NAME);
    if let Ok(existing) = std::fs::read(&path) {
        if existing == ASKPASS_SCRIPT.as_bytes() {
            return Ok(path);
        }
    }
    let staging = state_dir.join(format!(
        ".{ASKPASS_FILE_NAME}.{}.{}",
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&staging, ASKPASS_SCRIPT)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set permissions on {}", staging.display()))?;
    }
    if let Err(err) = std::fs::rename(&staging, &path) {
        let _ = std::fs::remove_file(&staging);
        return Err(err).with_context(|| format!("failed to install {}", path.display()));
    }
    Ok(path)
}

pub fn apply_askpass_env(
    cmd: &mut Command,
    state_dir: &Path,
    secrets: &AskpassSecrets,
) -> anyhow::Result<()> {
    for (key, value) in askpass_env(state_dir, secrets)? {
        cmd.env(key, value);
    }
    Ok(())
}
