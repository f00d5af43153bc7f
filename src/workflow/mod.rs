//! Operator workflows built on the runner, codec, inspector and prompt
//! layers.

pub mod install;
pub mod migrate;
pub mod reconfigure;
pub mod status;
pub mod versions;

use crate::display::{format_check, Console, Status};
use crate::envfile::EnvMap;
use crate::error::DkError;
use crate::prompt::{ask_field, FieldKind, FieldSpec, Prompter};
use crate::runner::{run_check, CommandRunner, Invocation};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub severity: Severity,
    pub message: String,
}

pub fn check(name: impl Into<String>, ok: bool, message: impl Into<String>) -> Check {
    Check {
        name: name.into(),
        ok,
        severity: Severity::Error,
        message: message.into(),
    }
}

/// A check whose failure is reported but never fails the run.
pub fn advisory(name: impl Into<String>, ok: bool, message: impl Into<String>) -> Check {
    Check {
        severity: Severity::Warning,
        ..check(name, ok, message)
    }
}

impl Check {
    pub fn is_blocking_failure(&self) -> bool {
        !self.ok && self.severity == Severity::Error
    }

    pub fn render(&self) -> String {
        format_check(&self.name, self.ok, &self.message)
    }
}

pub struct ConfigSection {
    pub title: &'static str,
    pub note: Option<&'static str>,
    pub fields: &'static [FieldSpec],
}

const fn text(key: &'static str, label: &'static str, required: bool, default: Option<&'static str>) -> FieldSpec {
    FieldSpec {
        key,
        label,
        kind: FieldKind::Text,
        required,
        install_default: default,
        confirm: false,
    }
}

const fn secret(key: &'static str, label: &'static str, required: bool) -> FieldSpec {
    FieldSpec {
        key,
        label,
        kind: FieldKind::Secret,
        required,
        install_default: None,
        confirm: required,
    }
}

/// Operator-supplied `.env` values, grouped the way both the installer and
/// the reconfigure tool present them.
pub const CONFIG_SECTIONS: &[ConfigSection] = &[
    ConfigSection {
        title: "Application URL",
        note: None,
        fields: &[text("DAGKNOWS_URL", "DagKnows URL (e.g., https://your-domain.com)", true, None)],
    },
    ConfigSection {
        title: "Database Settings",
        note: None,
        fields: &[secret("POSTGRESQL_DB_PASSWORD", "PostgreSQL Database Password", true)],
    },
    ConfigSection {
        title: "Super User Settings",
        note: None,
        fields: &[
            FieldSpec {
                key: "SUPER_USER",
                label: "Super User Email",
                kind: FieldKind::Email,
                required: true,
                install_default: Some("admin@example.com"),
                confirm: false,
            },
            text("SUPER_USER_FIRSTNAME", "Super User First Name", true, Some("Admin")),
            text("SUPER_USER_LASTNAME", "Super User Last Name", true, Some("User")),
            secret("SUPER_PASSWORD", "Super User Password", true),
            text("SUPER_USER_ORG", "Super User Organization", true, Some("default_org")),
        ],
    },
    ConfigSection {
        title: "Mail Configuration",
        note: Some("Leave blank if you don't want to configure email now"),
        fields: &[
            FieldSpec {
                key: "MAIL_DEFAULT_SENDER",
                label: "Mail Default Sender",
                kind: FieldKind::Email,
                required: false,
                install_default: Some("info@dagknows.com"),
                confirm: false,
            },
            text("MAIL_USERNAME", "Mail Username", false, None),
            text("MAIL_SERVER", "Mail Server (e.g., smtp.gmail.com)", false, None),
            secret("MAIL_PASSWORD", "Mail Password", false),
        ],
    },
    ConfigSection {
        title: "OpenAI Configuration",
        note: Some("Leave blank if you don't want to configure OpenAI now"),
        fields: &[
            secret("OPENAI_API_KEY", "OpenAI API Key", false),
            text("OPENAI_ORG_ID", "OpenAI Organization ID", false, None),
        ],
    },
];

/// Prompts every field of `section`, using `default_for` to pick the value
/// an empty answer keeps.
pub fn ask_section<P, F>(
    prompter: &mut P,
    section: &ConfigSection,
    values: &mut EnvMap,
    default_for: F,
) -> Result<(), DkError>
where
    P: Prompter + ?Sized,
    F: Fn(&FieldSpec) -> Option<String>,
{
    for field in section.fields {
        let default = default_for(field);
        let value = ask_field(prompter, field, default.as_deref())?;
        values.insert(field.key.to_string(), value);
    }
    Ok(())
}

pub fn running_as_root<R: CommandRunner + ?Sized>(runner: &R, cwd: &Path) -> bool {
    let outcome = run_check(runner, cwd, &Invocation::new("id").arg("-u").captured());
    outcome.success && outcome.output.trim() == "0"
}

/// Prefixes `sudo` unless the process already runs as root.
pub fn privileged(invocation: Invocation, as_root: bool) -> Invocation {
    if as_root {
        return invocation;
    }
    Invocation {
        program: "sudo".to_string(),
        args: std::iter::once(invocation.program)
            .chain(invocation.args)
            .collect(),
        ..invocation
    }
}

/// Yes/no gate; a declined answer becomes [`DkError::Cancelled`].
pub fn require_confirmation<P: Prompter + ?Sized>(
    prompter: &mut P,
    prompt: &str,
    default: bool,
    cancel_message: &str,
) -> Result<(), DkError> {
    if prompter.confirm(prompt, default)? {
        Ok(())
    } else {
        Err(DkError::cancelled(cancel_message))
    }
}

pub fn print_checks(console: &Console, checks: &[Check]) {
    for item in checks {
        if item.ok || item.severity == Severity::Error {
            console.line(&item.render());
        } else {
            console.status(Status::Warning, &format!("{}: {}", item.name, item.message));
        }
    }
}
