//! `dkdeploy reconfigure`: edit the encrypted `.env` section by section.

use super::{ask_section, CONFIG_SECTIONS};
use crate::config::Context;
use crate::display::{Console, Status};
use crate::envfile::{self, EnvMap, RECONFIGURE_HEADER};
use crate::error::DkError;
use crate::fsutil::{backup_file, restore_backup};
use crate::prompt::Prompter;
use crate::runner::CommandRunner;
use crate::secrets::{decrypt_interactive, encrypt_symmetric, CleanupRegistry, PlaintextFile};
use serde::Serialize;
use std::fs;

#[derive(Debug, Clone, Serialize)]
pub struct ReconfigureSummary {
    pub updated_sections: Vec<String>,
}

/// Decrypts the current configuration; the plaintext copy is gone before
/// this returns.
pub fn load_encrypted_config<R: CommandRunner + ?Sized>(
    ctx: &Context,
    runner: &R,
    cleanup: &CleanupRegistry,
) -> Result<EnvMap, DkError> {
    let encrypted = ctx.env_encrypted_path();
    if !encrypted.exists() {
        return Err(DkError::Config(format!(
            "{} not found. Have you run `dkdeploy install`?",
            encrypted.display()
        )));
    }
    let plain_path = ctx.env_plain_path();
    if plain_path.exists() {
        return Err(DkError::Config(format!(
            "{} already exists; remove the plaintext file before reconfiguring",
            plain_path.display()
        )));
    }
    let scope = PlaintextFile::adopt(cleanup, &plain_path);
    if !decrypt_interactive(runner, &ctx.project_dir, &encrypted, &scope) {
        return Err(DkError::Process(format!(
            "Failed to decrypt {}. Wrong password?",
            encrypted.display()
        )));
    }
    envfile::read(scope.path())
}

pub fn run_reconfigure<R, P>(
    ctx: &Context,
    runner: &R,
    prompter: &mut P,
    console: &Console,
    cleanup: &CleanupRegistry,
) -> Result<ReconfigureSummary, DkError>
where
    R: CommandRunner + ?Sized,
    P: Prompter + ?Sized,
{
    console.header("DagKnows Reconfiguration Tool");
    console.status(
        Status::Info,
        "This tool allows you to update your DagKnows configuration",
    );
    console.status(
        Status::Info,
        "without going through the full installation process.",
    );
    console.blank();

    console.status(Status::Info, "Decrypting current configuration...");
    console.status(Status::Warning, "You will need to enter your encryption password:");
    let mut values = load_encrypted_config(ctx, runner, cleanup)?;
    console.status(
        Status::Success,
        &format!("Loaded {} configuration parameters", values.len()),
    );

    let encrypted = ctx.env_encrypted_path();
    // Held only until the new file is encrypted.
    let backup = backup_file(&encrypted)?;

    let mut updated_sections = Vec::new();
    for section in CONFIG_SECTIONS {
        console.blank();
        console.bold(section.title);
        if !prompter.confirm("Update this section?", false)? {
            console.status(Status::Info, &format!("{} unchanged", section.title));
            continue;
        }
        if let Some(note) = section.note {
            console.status(Status::Info, note);
        }
        let current = values.clone();
        ask_section(prompter, section, &mut values, |field| {
            current.get(field.key).cloned()
        })?;
        console.status(Status::Success, &format!("{} updated", section.title));
        updated_sections.push(section.title.to_string());
    }
    envfile::sync_default_org(&mut values);

    console.header("Saving Configuration");
    {
        let scope = PlaintextFile::create(
            cleanup,
            &ctx.env_plain_path(),
            &envfile::serialize(&values, RECONFIGURE_HEADER),
        )?;
        console.status(Status::Success, "Configuration file updated");
        console.status(Status::Info, "Encrypting configuration...");
        console.status(
            Status::Warning,
            "Enter your encryption password (same as before or new):",
        );
        if !encrypt_symmetric(runner, &ctx.project_dir, &scope, &encrypted) {
            if let Some(path) = &backup {
                restore_backup(&encrypted, path)?;
            }
            return Err(DkError::Process("Failed to encrypt configuration".to_string()));
        }
    }
    console.status(Status::Success, "Configuration encrypted successfully");
    if let Some(path) = &backup {
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove configuration backup");
        }
    }

    console.header("Reconfiguration Complete");
    console.status(Status::Success, "Your configuration has been updated!");
    console.blank();
    console.status(Status::Info, "To apply the changes, restart your services:");
    console.command_hint("make restart");
    console.blank();

    Ok(ReconfigureSummary { updated_sections })
}
