use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "compose-hosts.toml";
pub(crate) const CONFIG_VERSIONS: &[&str] = &["0", "0.1"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HostsConfig {
    #[serde(default)]
    pub(crate) version: String,
    #[serde(default)]
    pub(crate) projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ProjectConfig {
    #[serde(default)]
    pub(crate) docker_host: String,
    pub(crate) docker_host_tunnel: Option<TunnelProfile>,
    pub(crate) compose_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TunnelProfile {
    Ssh(SshProfile),
}

/// String fields accept `$NAME` placeholders, expanded when the tunnel opens.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct SshProfile {
    pub(crate) host: String,
    pub(crate) host_key_file: Option<String>,
    #[serde(default, rename = "agent")]
    pub(crate) use_agent: bool,
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) key_file: Option<String>,
    pub(crate) key_passphrase: Option<String>,
}

/// One project, named after its key in the config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) name: String,
    pub(crate) docker_host: String,
    pub(crate) tunnel: Option<TunnelProfile>,
    pub(crate) compose_file: PathBuf,
}

/// Targets sorted by name; never modified after loading.
#[derive(Clone, Debug, Default)]
pub(crate) struct Targets(Vec<Arc<Target>>);

impl Targets {
    /// Names each project after its key; compose files are resolved against `base_dir`.
    pub(crate) fn from_projects(
        projects: BTreeMap<String, ProjectConfig>,
        base_dir: &Path,
    ) -> Self {
        let mut targets: Vec<Arc<Target>> = projects
            .into_iter()
            .map(|(name, project)| {
                Arc::new(Target {
                    name,
                    docker_host: project.docker_host,
                    tunnel: project.docker_host_tunnel,
                    compose_file: base_dir.join(project.compose_file),
                })
            })
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        Self(targets)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.0.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) fn load_targets(path: &Path) -> anyhow::Result<Targets> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: HostsConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    validate_version(&config.version, path)?;
    let base_dir = config_dir(path)?;
    Ok(Targets::from_projects(config.projects, &base_dir))
}

fn validate_version(version: &str, path: &Path) -> anyhow::Result<()> {
    if version.is_empty() {
        anyhow::bail!(
            "a version must be specified in {}. valid choices: {:?}",
            path.display(),
            CONFIG_VERSIONS
        );
    }
    if !CONFIG_VERSIONS.contains(&version) {
        anyhow::bail!(
            "invalid version {:?} specified in {}. valid choices: {:?}",
            version,
            path.display(),
            CONFIG_VERSIONS
        );
    }
    Ok(())
}

fn config_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if dir.is_absolute() {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    Ok(cwd.join(dir))
}
