//! The version manifest (`version-manifest.yaml`) and the `versions.env`
//! file derived from it.

use crate::config::RegistryDefaults;
use crate::error::DkError;
use crate::inspector::{ContainerObservation, SERVICES};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const SCHEMA_VERSION: &str = "1.0";
pub const DEFAULT_TAG: &str = "latest";
pub const MIGRATION_ACTOR: &str = "migration";
/// Tag variable the deployment descriptor must reference once it consumes
/// `versions.env`.
pub const SENTINEL_TAG_VARIABLE: &str = "DK_REQ_ROUTER_TAG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub schema_version: String,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub ecr: RegistryConfig,
    pub services: IndexMap<String, ServiceVersionRecord>,
    #[serde(default)]
    pub history: IndexMap<String, Vec<HistoryEntry>>,
    #[serde(default)]
    pub custom_overrides: IndexMap<String, CustomOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub registry: String,
    pub repository_alias: String,
    pub use_private: bool,
    pub private_registry: String,
    pub private_region: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_defaults(&RegistryDefaults::default())
    }
}

impl RegistryConfig {
    pub fn from_defaults(defaults: &RegistryDefaults) -> Self {
        Self {
            registry: defaults.registry.clone(),
            repository_alias: defaults.repository_alias.clone(),
            use_private: false,
            private_registry: String::new(),
            private_region: "us-east-1".to_string(),
        }
    }

    /// `<registry>/<alias>`. The private registry fields are carried in the
    /// document but never change generated image references.
    pub fn image_base(&self) -> String {
        let registry = self.registry.trim_end_matches('/');
        if self.repository_alias.is_empty() {
            registry.to_string()
        } else {
            format!("{registry}/{}", self.repository_alias)
        }
    }

    pub fn image_for(&self, service: &str) -> String {
        format!("{}/{service}", self.image_base())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersionRecord {
    pub image: String,
    pub current_tag: String,
    #[serde(default)]
    pub deployed_at: String,
    #[serde(default)]
    pub deployed_by: String,
    #[serde(default)]
    pub image_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tag: String,
    pub deployed_at: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomOverride {
    #[serde(default)]
    pub tag: Option<String>,
}

impl VersionManifest {
    pub fn override_tag(&self, service: &str) -> Option<&str> {
        self.custom_overrides
            .get(service)
            .and_then(|o| o.tag.as_deref())
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
    }

    /// The tag that is displayed and deployed: a non-empty override wins over
    /// the recorded current tag.
    pub fn effective_tag(&self, service: &str) -> String {
        if let Some(tag) = self.override_tag(service) {
            return tag.to_string();
        }
        self.services
            .get(service)
            .map(|record| record.current_tag.clone())
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| DEFAULT_TAG.to_string())
    }
}

pub fn parse(text: &str) -> Result<VersionManifest, DkError> {
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    let Some(mapping) = value.as_mapping() else {
        return Err(DkError::Format(
            "manifest must be a mapping at the top level".to_string(),
        ));
    };
    if !mapping.contains_key("services") {
        return Err(DkError::Format(
            "manifest is missing the top-level `services` key".to_string(),
        ));
    }
    let manifest: VersionManifest = serde_yaml::from_value(value)
        .map_err(|err| DkError::Format(format!("invalid manifest structure: {err}")))?;
    check_schema_version(&manifest.schema_version)?;
    Ok(manifest)
}

fn check_schema_version(version: &str) -> Result<(), DkError> {
    let major = version.split('.').next().unwrap_or_default().trim();
    if major == "1" {
        return Ok(());
    }
    Err(DkError::Format(format!(
        "unsupported manifest schema_version {version:?} (expected 1.x)"
    )))
}

pub fn serialize(manifest: &VersionManifest) -> Result<String, DkError> {
    Ok(serde_yaml::to_string(manifest)?)
}

pub fn read(path: &Path) -> Result<VersionManifest, DkError> {
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds a manifest covering every canonical service. Services that were not
/// observed are recorded at `latest` with an empty digest.
pub fn build_manifest(
    observations: &BTreeMap<String, ContainerObservation>,
    customer_id: &str,
    deployment_id: &str,
    ecr: RegistryConfig,
    now: DateTime<Utc>,
) -> VersionManifest {
    let deployed_at = timestamp(now);
    let deployment_id = if deployment_id.trim().is_empty() {
        format!("dkapp-{}", now.format("%Y%m%d"))
    } else {
        deployment_id.trim().to_string()
    };

    let mut services = IndexMap::new();
    let mut history = IndexMap::new();
    for service in SERVICES {
        let observed = observations.get(service);
        let tag = observed
            .map(|o| o.tag.clone())
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        let digest = observed.map(|o| o.digest.clone()).unwrap_or_default();

        services.insert(
            service.to_string(),
            ServiceVersionRecord {
                image: ecr.image_for(service),
                current_tag: tag.clone(),
                deployed_at: deployed_at.clone(),
                deployed_by: MIGRATION_ACTOR.to_string(),
                image_digest: digest,
            },
        );
        history.insert(
            service.to_string(),
            vec![HistoryEntry {
                tag,
                deployed_at: deployed_at.clone(),
                status: "current".to_string(),
            }],
        );
    }

    VersionManifest {
        schema_version: SCHEMA_VERSION.to_string(),
        deployment_id,
        customer_id: customer_id.trim().to_string(),
        ecr,
        services,
        history,
        custom_overrides: IndexMap::new(),
    }
}

pub fn env_var_prefix(service: &str) -> String {
    format!("DK_{}", service.to_uppercase())
}

/// Renders `versions.env`. Output depends only on the manifest and
/// `generated_at`.
pub fn generate_versions_env(manifest: &VersionManifest, generated_at: &str) -> String {
    let base = manifest.ecr.image_base();
    let mut lines = vec![
        "# DagKnows Service Versions".to_string(),
        "# Auto-generated from version-manifest.yaml - DO NOT EDIT MANUALLY".to_string(),
        format!("# Generated: {generated_at}"),
        String::new(),
        format!("DK_ECR_REGISTRY={base}"),
        String::new(),
    ];
    for service in SERVICES {
        let prefix = env_var_prefix(service);
        lines.push(format!("{prefix}_IMAGE={base}/{service}"));
        lines.push(format!("{prefix}_TAG={}", manifest.effective_tag(service)));
        lines.push(String::new());
    }
    lines.join("\n")
}
