//! Flat `KEY=VALUE` configuration documents (`.env`, `.env.default`).

use crate::error::DkError;
use indexmap::IndexMap;
use std::fs;
use std::path::Path;

pub type EnvMap = IndexMap<String, String>;

pub const SECRET_MASK: &str = "********";

pub const INSTALL_HEADER: &[&str] = &[
    "DagKnows Configuration File",
    "Generated by DagKnows Installation Wizard",
];

pub const RECONFIGURE_HEADER: &[&str] = &[
    "DagKnows Configuration File",
    "Updated by DagKnows Reconfiguration Tool",
];

/// Values that never need operator input, in file order.
const BASE_DEFAULTS: &[(&str, &str)] = &[
    ("APP_SECRET_KEY", "your_secret_key_here_change_this"),
    ("DAGKNOWS_WSFE_URL", "http://wsfe:4446"),
    ("DAGKNOWS_ELASTIC_URL", "http://elasticsearch:9200"),
    ("DAGKNOWS_FORCE_TOKEN", ""),
    ("POSTGRESQL_DB_HOST", "postgres"),
    ("POSTGRESQL_DB_PORT", "5432"),
    ("POSTGRESQL_DB_NAME", "postgres"),
    ("POSTGRESQL_DB_USER", "postgres"),
    ("COMMUNITY_URL", ""),
    ("COMMUNITY", ""),
    ("NO_SSL", "false"),
    ("ENFORCE_LOGIN", "true"),
    ("ENFORCE_SECURE_COOKIE", "true"),
    ("SUPPORT_AD_AUTHENTICATION", "false"),
    ("VERBOSE", "false"),
    ("CUSTOMER_AD_EMAIL_ATTR", ""),
    ("CUSTOMER_AD_SEARCH_BASE_OU", ""),
    ("CUSTOMER_AD_SERVER_URI", ""),
    ("CUSTOMER_AD_SERVICE_PASSWORD", ""),
    ("CUSTOMER_AD_SERVICE_USERNAME", ""),
    ("CUSTOMER_AD_USERNAME_ATTR", ""),
    ("CUSTOMER_AD_USE_TLS", ""),
    ("DEFAULT_PAGE_SIZE", "20"),
    ("ENABLE_WEBSOCKETS", "true"),
    ("DOWNLOAD_TASK_ID", ""),
    ("NITRO_PRESET", "node-server"),
    ("NUXT_PUBLIC_GTAG_ID", ""),
    ("api_key", ""),
];

pub const ENV_DEFAULT_TEMPLATE: &str = include_str!("../config/env.default");

pub fn parse(text: &str) -> EnvMap {
    let mut values = EnvMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(key.trim().to_string(), value.to_string());
    }
    values
}

pub fn serialize(values: &EnvMap, header: &[&str]) -> String {
    let mut content = String::new();
    for line in header {
        content.push_str("# ");
        content.push_str(line);
        content.push('\n');
    }
    if !header.is_empty() {
        content.push('\n');
    }
    for (key, value) in values {
        content.push_str(&format!("{key}={value}\n"));
    }
    content
}

pub fn base_defaults() -> EnvMap {
    BASE_DEFAULTS
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Defaults with `overrides` applied; default keys keep their position and
/// new keys are appended in override order.
pub fn merge_defaults(overrides: &EnvMap) -> EnvMap {
    let mut merged = base_defaults();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// `DEFAULT_ORG` always follows `SUPER_USER_ORG`.
pub fn sync_default_org(values: &mut EnvMap) {
    if let Some(org) = values.get("SUPER_USER_ORG").cloned() {
        values.insert("DEFAULT_ORG".to_string(), org);
    }
}

pub fn mask(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        SECRET_MASK
    }
}

pub fn read(path: &Path) -> Result<EnvMap, DkError> {
    let content = fs::read_to_string(path)?;
    Ok(parse(&content))
}

pub fn lookup(text: &str, key: &str) -> Option<String> {
    parse(text).get(key).map(|value| value.trim().to_string())
}
