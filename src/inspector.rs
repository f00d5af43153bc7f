//! Running-container discovery through `docker compose ps` and `docker inspect`.

use crate::runner::{run_check, CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Canonical service ids, in the order every report and generated file uses.
pub const SERVICES: [&str; 9] = [
    "req_router",
    "taskservice",
    "settings",
    "conv_mgr",
    "wsfe",
    "jobsched",
    "apigateway",
    "ansi_processing",
    "dagknows_nuxt",
];

const COMPOSE_TO_SERVICE: [(&str, &str); 9] = [
    ("req-router", "req_router"),
    ("taskservice", "taskservice"),
    ("settings", "settings"),
    ("conv-mgr", "conv_mgr"),
    ("wsfe", "wsfe"),
    ("jobsched", "jobsched"),
    ("apigateway", "apigateway"),
    ("ansi-processing", "ansi_processing"),
    ("dagknows-nuxt", "dagknows_nuxt"),
];

pub fn canonical_service(compose_service: &str) -> Option<&'static str> {
    COMPOSE_TO_SERVICE
        .iter()
        .find(|(compose, _)| *compose == compose_service)
        .map(|(_, service)| *service)
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ComposePsRow {
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
}

impl ComposePsRow {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct RowParseError {
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Lazily parses compose ps output. Newline-delimited objects yield one item
/// per non-blank line so a bad line only costs that row; a JSON array
/// document (newer compose releases) is accepted whole.
pub fn parse_ps_rows(
    text: &str,
) -> Box<dyn Iterator<Item = Result<ComposePsRow, RowParseError>> + '_> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        if let Ok(rows) = serde_json::from_str::<Vec<ComposePsRow>>(trimmed) {
            return Box::new(rows.into_iter().map(Ok));
        }
    }
    Box::new(
        text.lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .map(|(line_no, line)| {
                serde_json::from_str::<ComposePsRow>(line).map_err(|source| RowParseError {
                    line: line_no,
                    source,
                })
            }),
    )
}

pub fn ok_rows(text: &str) -> Vec<ComposePsRow> {
    parse_ps_rows(text)
        .filter_map(|row| match row {
            Ok(row) => Some(row),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed compose ps row");
                None
            }
        })
        .collect()
}

/// Splits `repo[:tag][@digest]` on the last tag colon. A colon followed by a
/// path segment is a registry port, not a tag.
pub fn split_image_reference(reference: &str) -> (String, String) {
    let name = reference.split('@').next().unwrap_or(reference);
    match name.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            (repo.to_string(), tag.to_string())
        }
        _ => (name.to_string(), "latest".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerObservation {
    pub compose_service: String,
    pub service_id: String,
    pub container_id: String,
    pub image: String,
    pub tag: String,
    pub digest: String,
    pub state: String,
    pub health: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub reference: String,
    pub digest: String,
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
    #[serde(rename = "Image", default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: Option<String>,
}

pub fn parse_inspect_output(text: &str) -> Option<ImageInfo> {
    let entries: Vec<InspectEntry> = match serde_json::from_str(text) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(error = %err, "malformed docker inspect output");
            return None;
        }
    };
    let entry = entries.into_iter().next()?;
    Some(ImageInfo {
        reference: entry.config.and_then(|c| c.image).unwrap_or_default(),
        digest: entry.image.unwrap_or_default(),
    })
}

pub struct Inspector<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    project_dir: &'a Path,
    timeout: Duration,
}

impl<'a, R: CommandRunner + ?Sized> Inspector<'a, R> {
    pub fn new(runner: &'a R, project_dir: &'a Path, timeout: Duration) -> Self {
        Self {
            runner,
            project_dir,
            timeout,
        }
    }

    /// Raw ps output; `None` when the command fails or prints nothing.
    pub fn compose_ps(&self, compose_file: Option<&str>) -> Option<String> {
        let mut invocation = Invocation::new("docker").arg("compose");
        if let Some(file) = compose_file {
            invocation = invocation.arg("-f").arg(file);
        }
        let invocation = invocation
            .args(["ps", "--format", "json"])
            .captured()
            .timeout(self.timeout);
        let outcome = run_check(self.runner, self.project_dir, &invocation);
        if !outcome.success || outcome.output.trim().is_empty() {
            return None;
        }
        Some(outcome.output)
    }

    pub fn inspect_image(&self, container_id: &str) -> Option<ImageInfo> {
        let invocation = Invocation::new("docker")
            .arg("inspect")
            .arg(container_id)
            .captured()
            .timeout(self.timeout);
        let outcome = run_check(self.runner, self.project_dir, &invocation);
        if !outcome.success {
            tracing::warn!(container_id, output = %outcome.output, "docker inspect failed");
            return None;
        }
        parse_inspect_output(&outcome.output)
    }

    /// Known services that currently have a container. "Nothing running" is an
    /// empty map, never an error.
    pub fn list_running_services(&self) -> BTreeMap<String, ContainerObservation> {
        let mut observed = BTreeMap::new();
        let Some(text) = self.compose_ps(None) else {
            return observed;
        };
        for row in ok_rows(&text) {
            let Some(service_id) = canonical_service(&row.service) else {
                tracing::debug!(service = %row.service, "ignoring unknown compose service");
                continue;
            };
            if row.id.is_empty() {
                continue;
            }
            let Some(info) = self.inspect_image(&row.id) else {
                continue;
            };
            let (image, tag) = split_image_reference(&info.reference);
            observed.insert(
                service_id.to_string(),
                ContainerObservation {
                    compose_service: row.service.clone(),
                    service_id: service_id.to_string(),
                    container_id: row.id.clone(),
                    image,
                    tag,
                    digest: info.digest,
                    state: row.state.clone(),
                    health: if row.health.is_empty() {
                        None
                    } else {
                        Some(row.health.clone())
                    },
                },
            );
        }
        observed
    }
}
