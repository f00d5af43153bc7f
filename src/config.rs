use crate::error::DkError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_FILE_NAME: &str = "dkdeploy.yaml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub registry: RegistryDefaults,
    pub files: Files,
    pub timeouts: Timeouts,
    pub install: InstallTiming,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryDefaults {
    pub registry: String,
    pub repository_alias: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Files {
    pub manifest: String,
    pub versions_env: String,
    pub env_plain: String,
    pub env_encrypted: String,
    pub compose: String,
    pub db_compose: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub probe_sec: u64,
    pub inspect_sec: u64,
    pub connectivity_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InstallTiming {
    pub docker_restart_delay_sec: u64,
    pub database_stabilize_delay_sec: u64,
    pub dblogs_preview_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            registry: RegistryDefaults::default(),
            files: Files::default(),
            timeouts: Timeouts::default(),
            install: InstallTiming::default(),
        }
    }
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            registry: "public.ecr.aws".to_string(),
            repository_alias: "n5k3t9x2".to_string(),
        }
    }
}

impl Default for Files {
    fn default() -> Self {
        Self {
            manifest: "version-manifest.yaml".to_string(),
            versions_env: "versions.env".to_string(),
            env_plain: ".env".to_string(),
            env_encrypted: ".env.gpg".to_string(),
            compose: "docker-compose.yml".to_string(),
            db_compose: "db-docker-compose.yml".to_string(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe_sec: 10,
            inspect_sec: 60,
            connectivity_sec: 5,
        }
    }
}

impl Default for InstallTiming {
    fn default() -> Self {
        Self {
            docker_restart_delay_sec: 3,
            database_stabilize_delay_sec: 10,
            dblogs_preview_sec: 10,
        }
    }
}

impl Timeouts {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_sec)
    }

    pub fn inspect(&self) -> Duration {
        Duration::from_secs(self.inspect_sec)
    }

    pub fn connectivity(&self) -> Duration {
        Duration::from_secs(self.connectivity_sec)
    }
}

/// Resolved per-invocation settings shared by every workflow.
#[derive(Debug, Clone)]
pub struct Context {
    pub project_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: Config,
    pub json: bool,
}

impl Context {
    pub fn project_file(&self, name: &str) -> PathBuf {
        self.project_dir.join(name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.project_file(&self.config.files.manifest)
    }

    pub fn versions_env_path(&self) -> PathBuf {
        self.project_file(&self.config.files.versions_env)
    }

    pub fn env_plain_path(&self) -> PathBuf {
        self.project_file(&self.config.files.env_plain)
    }

    pub fn env_encrypted_path(&self) -> PathBuf {
        self.project_file(&self.config.files.env_encrypted)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.project_file(&self.config.files.compose)
    }
}

pub fn build_context(
    dir_override: Option<&PathBuf>,
    config_override: Option<&PathBuf>,
    json: bool,
) -> Result<Context, DkError> {
    let project_dir = resolve_project_dir(dir_override);
    let config_path = resolve_config_path(config_override, &project_dir);
    let config = if config_path.exists() {
        read_config(&config_path).map_err(|err| {
            DkError::Config(format!(
                "config is invalid. Please edit {} and try again. ({})",
                config_path.display(),
                err
            ))
        })?
    } else {
        Config::default()
    };
    Ok(Context {
        project_dir,
        config_path,
        config,
        json,
    })
}

fn resolve_project_dir(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return PathBuf::from(expand_path(&path.to_string_lossy()));
    }
    if let Ok(path) = env::var("DKDEPLOY_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_path(&path));
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_config_path(override_path: Option<&PathBuf>, project_dir: &Path) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("DKDEPLOY_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_path(&path));
        }
    }
    project_dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
pub(crate) fn test_context(project_dir: &Path) -> Context {
    Context {
        project_dir: project_dir.to_path_buf(),
        config_path: project_dir.join(CONFIG_FILE_NAME),
        config: Config::default(),
        json: false,
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, DkError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, DkError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn validate_config(cfg: &Config) -> Result<(), DkError> {
    if cfg.version != 1 {
        return Err(DkError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.registry.registry.trim().is_empty() {
        return Err(DkError::Config("registry.registry must be non-empty".to_string()));
    }
    let files = [
        ("files.manifest", &cfg.files.manifest),
        ("files.versions_env", &cfg.files.versions_env),
        ("files.env_plain", &cfg.files.env_plain),
        ("files.env_encrypted", &cfg.files.env_encrypted),
    ];
    for (field, value) in files {
        if value.trim().is_empty() {
            return Err(DkError::Config(format!("{field} must be non-empty")));
        }
    }
    if cfg.files.env_plain == cfg.files.env_encrypted {
        return Err(DkError::Config(
            "files.env_plain and files.env_encrypted must differ".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.files.manifest, "version-manifest.yaml");
        assert_eq!(cfg.timeouts.probe(), Duration::from_secs(10));
        assert_eq!(cfg.install.database_stabilize_delay_sec, 10);
    }

    #[test]
    fn embedded_default_config_matches_defaults() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default yaml");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = read_config_from_str("version: 2").expect_err("version 2");
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn identical_env_paths_are_rejected() {
        let yaml = "version: 1\nfiles:\n  env_plain: .env\n  env_encrypted: .env\n";
        let err = read_config_from_str(yaml).expect_err("same paths");
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn context_uses_project_config_when_present() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "version: 1\nfiles:\n  manifest: manifest.yaml\n",
        )
        .unwrap();
        let dir_path = dir.path().to_path_buf();
        let ctx = build_context(Some(&dir_path), None, false).expect("context");
        assert_eq!(ctx.manifest_path(), dir.path().join("manifest.yaml"));
        assert_eq!(ctx.versions_env_path(), dir.path().join("versions.env"));
    }

    #[test]
    fn invalid_project_config_is_actionable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "version: 1\nbogus: 1\n").unwrap();
        let dir_path = dir.path().to_path_buf();
        let err = build_context(Some(&dir_path), None, false).expect_err("invalid");
        assert!(err.to_string().contains("config is invalid"));
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/dkapp");
        assert!(!expanded.starts_with("~/"));
    }
}
