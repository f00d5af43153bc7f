//! `dkdeploy versions env|show`: work from an existing manifest.

use crate::config::Context;
use crate::display::{format_version_row, Console, Status};
use crate::error::DkError;
use crate::fsutil::write_atomic_text_file;
use crate::inspector::SERVICES;
use crate::manifest::{self, VersionManifest};
use chrono::{DateTime, Utc};
use dialoguer::console::style;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRow {
    pub service: String,
    pub image: String,
    pub current_tag: String,
    pub effective_tag: String,
    pub custom: bool,
    pub deployed_at: String,
}

fn read_manifest(ctx: &Context) -> Result<VersionManifest, DkError> {
    let path = ctx.manifest_path();
    if !path.exists() {
        return Err(DkError::Config(format!(
            "{} not found. Run: dkdeploy migrate",
            path.display()
        )));
    }
    manifest::read(&path)
}

pub fn version_rows(manifest: &VersionManifest) -> Vec<VersionRow> {
    SERVICES
        .iter()
        .map(|service| {
            let record = manifest.services.get(*service);
            VersionRow {
                service: service.to_string(),
                image: record
                    .map(|r| r.image.clone())
                    .unwrap_or_else(|| manifest.ecr.image_for(service)),
                current_tag: record.map(|r| r.current_tag.clone()).unwrap_or_default(),
                effective_tag: manifest.effective_tag(service),
                custom: manifest.override_tag(service).is_some(),
                deployed_at: record.map(|r| r.deployed_at.clone()).unwrap_or_default(),
            }
        })
        .collect()
}

pub fn show_versions(ctx: &Context, console: &Console) -> Result<Vec<VersionRow>, DkError> {
    let manifest = read_manifest(ctx)?;
    let rows = version_rows(&manifest);
    console.header("Installed Versions");
    if !manifest.deployment_id.is_empty() {
        console.line(&format!("  Deployment: {}", manifest.deployment_id));
    }
    if !manifest.customer_id.is_empty() {
        console.line(&format!("  Customer:   {}", manifest.customer_id));
    }
    console.line(&format!("  Registry:   {}", manifest.ecr.image_base()));
    console.blank();
    for row in &rows {
        let marker = if row.custom {
            style(format!("[custom, recorded {}]", row.current_tag))
                .yellow()
                .to_string()
        } else {
            String::new()
        };
        let known = manifest.services.contains_key(&row.service);
        console.line(&format_version_row(known, &row.service, &row.effective_tag, &marker));
    }
    Ok(rows)
}

pub fn regenerate_versions_env(
    ctx: &Context,
    console: &Console,
    now: DateTime<Utc>,
) -> Result<PathBuf, DkError> {
    let manifest = read_manifest(ctx)?;
    let content = manifest::generate_versions_env(&manifest, &manifest::timestamp(now));
    let path = ctx.versions_env_path();
    write_atomic_text_file(&path, &content)?;
    console.status(Status::Success, &format!("Created {}", path.display()));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_context;
    use crate::manifest::CustomOverride;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn write_manifest(ctx: &Context, overrides: &[(&str, &str)]) {
        let mut built = manifest::build_manifest(
            &BTreeMap::new(),
            "acme",
            "prod",
            manifest::RegistryConfig::default(),
            Utc::now(),
        );
        for (service, tag) in overrides {
            built.custom_overrides.insert(
                service.to_string(),
                CustomOverride {
                    tag: Some(tag.to_string()),
                },
            );
        }
        fs::write(ctx.manifest_path(), manifest::serialize(&built).unwrap()).unwrap();
    }

    #[test]
    fn rows_follow_canonical_order_and_overrides() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_manifest(&ctx, &[("wsfe", "v2")]);
        let rows = show_versions(&ctx, &Console::new(true)).unwrap();
        let services: Vec<&str> = rows.iter().map(|r| r.service.as_str()).collect();
        assert_eq!(services, SERVICES.to_vec());
        let wsfe = &rows[4];
        assert_eq!(wsfe.current_tag, "latest");
        assert_eq!(wsfe.effective_tag, "v2");
        assert!(wsfe.custom);
        assert!(!rows[0].custom);
    }

    #[test]
    fn regenerated_env_uses_override_tags() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        write_manifest(&ctx, &[("req_router", "1.4.0")]);
        let path = regenerate_versions_env(&ctx, &Console::new(true), Utc::now()).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("DK_REQ_ROUTER_TAG=1.4.0\n"));
        assert!(text.contains("DK_WSFE_TAG=latest\n"));
    }

    #[test]
    fn missing_manifest_points_at_migrate() {
        let dir = tempdir().unwrap();
        let err = show_versions(&test_context(dir.path()), &Console::new(true)).unwrap_err();
        assert!(err.to_string().contains("dkdeploy migrate"));
    }
}
