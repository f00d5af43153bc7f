//! Operator prompts: defaults, required re-asks, email validation and masked
//! secrets.

use crate::display::{format_status, Status};
use crate::envfile::mask;
use crate::error::DkError;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use regex::Regex;
use std::sync::OnceLock;

pub trait Prompter {
    fn read_line(&mut self, prompt: &str) -> Result<String, DkError>;
    fn read_secret(&mut self, prompt: &str) -> Result<String, DkError>;
    fn confirm(&mut self, prompt: &str, default: bool) -> Result<bool, DkError>;
    fn notice(&mut self, status: Status, message: &str);
}

pub struct TermPrompter {
    theme: ColorfulTheme,
}

impl TermPrompter {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for TermPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TermPrompter {
    fn read_line(&mut self, prompt: &str) -> Result<String, DkError> {
        Ok(Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?)
    }

    fn read_secret(&mut self, prompt: &str) -> Result<String, DkError> {
        Ok(Password::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()?)
    }

    fn confirm(&mut self, prompt: &str, default: bool) -> Result<bool, DkError> {
        Ok(Confirm::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default)
            .interact()?)
    }

    fn notice(&mut self, status: Status, message: &str) {
        println!("{}", format_status(status, message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Email,
    Secret,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    /// Suggested value on a fresh install.
    pub install_default: Option<&'static str>,
    /// Ask twice for newly typed values.
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOutcome {
    UseDefault(String),
    ReAsk,
    Accept(String),
}

/// One step of the per-field state machine. Secrets are taken verbatim;
/// other answers are trimmed.
pub fn resolve_answer(
    raw: &str,
    kind: FieldKind,
    default: Option<&str>,
    required: bool,
) -> FieldOutcome {
    let answer = match kind {
        FieldKind::Secret => raw,
        FieldKind::Text | FieldKind::Email => raw.trim(),
    };
    if !answer.is_empty() {
        return FieldOutcome::Accept(answer.to_string());
    }
    match default.filter(|value| !value.is_empty()) {
        Some(value) => FieldOutcome::UseDefault(value.to_string()),
        None if required => FieldOutcome::ReAsk,
        None => FieldOutcome::Accept(String::new()),
    }
}

pub fn is_valid_email(value: &str) -> bool {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

fn prompt_text(field: &FieldSpec, default: Option<&str>) -> String {
    match default.filter(|value| !value.is_empty()) {
        Some(value) if field.kind == FieldKind::Secret => {
            format!("{} [{}]", field.label, mask(value))
        }
        Some(value) => format!("{} [{value}]", field.label),
        None => field.label.to_string(),
    }
}

/// Asks until the answer is acceptable. `default` is the install suggestion
/// or, when reconfiguring, the current value; an empty answer keeps it.
pub fn ask_field<P: Prompter + ?Sized>(
    prompter: &mut P,
    field: &FieldSpec,
    default: Option<&str>,
) -> Result<String, DkError> {
    let text = prompt_text(field, default);
    loop {
        let raw = match field.kind {
            FieldKind::Secret => prompter.read_secret(&text)?,
            FieldKind::Text | FieldKind::Email => prompter.read_line(&text)?,
        };
        let value = match resolve_answer(&raw, field.kind, default, field.required) {
            FieldOutcome::ReAsk => {
                prompter.notice(Status::Error, "This field is required");
                continue;
            }
            FieldOutcome::UseDefault(value) => return Ok(value),
            FieldOutcome::Accept(value) => value,
        };
        if field.kind == FieldKind::Email && !value.is_empty() && !is_valid_email(&value) {
            prompter.notice(Status::Error, "Please enter a valid email address");
            continue;
        }
        if field.confirm && !value.is_empty() {
            let again = prompter.read_secret(&format!("Confirm {}", field.label))?;
            if again != value {
                prompter.notice(Status::Error, "Values do not match, please try again");
                continue;
            }
        }
        return Ok(value);
    }
}
