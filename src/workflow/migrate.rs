//! `dkdeploy migrate` and `dkdeploy verify`.

use super::{advisory, check, print_checks, require_confirmation, Check};
use crate::config::Context;
use crate::display::{format_version_row, Console, Status};
use crate::error::DkError;
use crate::fsutil::{backup_file, restore_backup, write_atomic_text_file};
use crate::inspector::{ContainerObservation, Inspector, SERVICES};
use crate::manifest::{self, RegistryConfig, SENTINEL_TAG_VARIABLE};
use crate::prompt::Prompter;
use crate::runner::CommandRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub yes: bool,
    pub force: bool,
    pub customer_id: Option<String>,
    pub deployment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub checks: Vec<Check>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        !self.checks.iter().any(Check::is_blocking_failure)
    }
}

/// Read-only verification of the migrated layout. Invalid content is
/// reported as a failed check, never as an error.
pub fn verify(ctx: &Context) -> VerifyReport {
    let files = &ctx.config.files;
    let mut checks = Vec::new();

    let manifest_path = ctx.manifest_path();
    if manifest_path.is_file() {
        checks.push(check(format!("{} found", files.manifest), true, ""));
        match manifest::read(&manifest_path) {
            Ok(_) => checks.push(check(format!("{} is valid", files.manifest), true, "")),
            Err(err) => checks.push(check(
                format!("{} is valid", files.manifest),
                false,
                err.to_string(),
            )),
        }
    } else {
        checks.push(check(
            format!("{} found", files.manifest),
            false,
            "Run: dkdeploy migrate",
        ));
    }

    let env_exists = ctx.versions_env_path().is_file();
    checks.push(check(
        format!("{} found", files.versions_env),
        env_exists,
        if env_exists { "" } else { "Run: dkdeploy versions env" },
    ));

    let compose_name = format!("{} uses version variables", files.compose);
    checks.push(match fs::read_to_string(ctx.compose_path()) {
        Ok(text) if text.contains(SENTINEL_TAG_VARIABLE) => advisory(compose_name, true, ""),
        Ok(_) => advisory(
            compose_name,
            false,
            format!("{} may need updating to use version variables", files.compose),
        ),
        Err(_) => advisory(compose_name, false, format!("{} not found", files.compose)),
    });

    VerifyReport { checks }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceTag {
    pub service: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrateSummary {
    pub manifest: PathBuf,
    pub versions_env: PathBuf,
    pub backup: Option<PathBuf>,
    pub detected: usize,
    pub services: Vec<ServiceTag>,
    pub verification: VerifyReport,
}

fn show_detected(console: &Console, observations: &BTreeMap<String, ContainerObservation>) {
    console.blank();
    console.line("Detected running containers:");
    console.blank();
    for service in SERVICES {
        match observations.get(service) {
            Some(observation) => {
                console.line(&format_version_row(true, service, &observation.tag, ""))
            }
            None => console.line(&format_version_row(false, service, "(not running)", "")),
        }
    }
    console.blank();
}

fn ask_optional<P: Prompter + ?Sized>(
    prompter: &mut P,
    preset: Option<&String>,
    yes: bool,
    prompt: &str,
) -> Result<String, DkError> {
    if let Some(value) = preset {
        return Ok(value.trim().to_string());
    }
    if yes {
        return Ok(String::new());
    }
    Ok(prompter.read_line(prompt)?.trim().to_string())
}

/// A file about to be replaced. `undo` puts the previous content back, or
/// removes the file when there was none.
struct PendingWrite {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl PendingWrite {
    fn begin(path: &Path) -> Result<Self, DkError> {
        Ok(Self {
            path: path.to_path_buf(),
            backup: backup_file(path)?,
        })
    }

    fn undo(&self) {
        let result = match &self.backup {
            Some(backup) => restore_backup(&self.path, backup),
            None => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
        };
        match result {
            Ok(()) => tracing::warn!(path = %self.path.display(), "rolled back"),
            Err(err) => tracing::warn!(path = %self.path.display(), error = %err, "rollback failed"),
        }
    }

    fn discard_backup(&self) {
        if let Some(backup) = &self.backup {
            if let Err(err) = fs::remove_file(backup) {
                tracing::debug!(path = %backup.display(), error = %err, "backup not removed");
            }
        }
    }
}

fn write_outputs(
    manifest_path: &Path,
    manifest_text: &str,
    env_path: &Path,
    env_text: &str,
    console: &Console,
) -> Result<(), DkError> {
    write_atomic_text_file(manifest_path, manifest_text)?;
    console.status(Status::Success, &format!("Created {}", manifest_path.display()));
    console.step("Generating versions.env...");
    write_atomic_text_file(env_path, env_text)?;
    console.status(Status::Success, &format!("Created {}", env_path.display()));
    Ok(())
}

pub fn run_migrate<R, P>(
    ctx: &Context,
    runner: &R,
    prompter: &mut P,
    console: &Console,
    options: &MigrateOptions,
    now: DateTime<Utc>,
) -> Result<MigrateSummary, DkError>
where
    R: CommandRunner + ?Sized,
    P: Prompter + ?Sized,
{
    console.header("DagKnows Version Migration Wizard");
    console.line("This wizard will enable version tracking for your DagKnows deployment.");
    console.line("It will create a version manifest based on your currently running containers.");
    console.blank();

    if !options.yes {
        require_confirmation(
            prompter,
            "This will enable version tracking. Continue?",
            false,
            "Migration cancelled",
        )?;
    }

    let manifest_path = ctx.manifest_path();
    if manifest_path.exists() && !options.force {
        console.status(
            Status::Warning,
            &format!("{} already exists!", ctx.config.files.manifest),
        );
        if options.yes {
            return Err(DkError::cancelled(format!(
                "{} already exists; pass --force to overwrite it",
                manifest_path.display()
            )));
        }
        require_confirmation(prompter, "Overwrite existing manifest?", false, "Migration cancelled")?;
    }

    console.step("Detecting current deployment state...");
    let inspector = Inspector::new(runner, &ctx.project_dir, ctx.config.timeouts.inspect());
    let observations = inspector.list_running_services();
    tracing::debug!(detected = observations.len(), "detected running services");

    if observations.is_empty() {
        console.status(Status::Warning, "No running containers detected.");
        console.status(
            Status::Info,
            "Make sure services are running with 'make up' before migration.",
        );
        if !options.yes {
            require_confirmation(
                prompter,
                "Continue anyway (will use 'latest' for all services)?",
                false,
                "Migration cancelled",
            )?;
        }
    } else {
        show_detected(console, &observations);
        if !options.yes {
            require_confirmation(
                prompter,
                "Create manifest from detected images?",
                false,
                "Migration cancelled",
            )?;
        }
    }

    console.step("Deployment Information (optional)");
    let customer_id = ask_optional(
        prompter,
        options.customer_id.as_ref(),
        options.yes,
        "Customer ID (press Enter to skip)",
    )?;
    let deployment_id = ask_optional(
        prompter,
        options.deployment_id.as_ref(),
        options.yes,
        "Deployment ID (press Enter for auto-generated)",
    )?;

    console.step(&format!("Creating {}...", ctx.config.files.manifest));
    let built = manifest::build_manifest(
        &observations,
        &customer_id,
        &deployment_id,
        RegistryConfig::from_defaults(&ctx.config.registry),
        now,
    );
    let manifest_text = manifest::serialize(&built)?;
    let env_text = manifest::generate_versions_env(&built, &manifest::timestamp(now));

    let manifest_write = PendingWrite::begin(&manifest_path)?;
    if let Some(path) = &manifest_write.backup {
        console.status(Status::Info, &format!("Backed up existing manifest to {}", path.display()));
    }
    let env_path = ctx.versions_env_path();
    let env_write = PendingWrite::begin(&env_path)?;
    let rollback = |err: DkError| -> DkError {
        manifest_write.undo();
        env_write.undo();
        err
    };

    write_outputs(&manifest_path, &manifest_text, &env_path, &env_text, console).map_err(&rollback)?;

    console.step("Verifying configuration...");
    let verification = verify(ctx);
    print_checks(console, &verification.checks);
    if !verification.ok() {
        console.status(Status::Error, "Migration verification failed!");
        return Err(rollback(DkError::Process(
            "migration verification failed".to_string(),
        )));
    }

    env_write.discard_backup();
    console.status(Status::Success, "Migration completed successfully!");
    console.blank();
    console.bold("Next steps:");
    console.line("  1. Run 'dkdeploy versions show' to see current versions");
    console.line("  2. Run 'make up' to restart with version tracking");
    console.line("  3. Run 'dkdeploy status' to check the deployment");
    console.blank();

    let services = SERVICES
        .iter()
        .map(|service| ServiceTag {
            service: service.to_string(),
            tag: built.effective_tag(service),
        })
        .collect();
    Ok(MigrateSummary {
        manifest: manifest_path,
        versions_env: env_path,
        backup: manifest_write.backup,
        detected: observations.len(),
        services,
        verification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_context;
    use crate::prompt::testing::ScriptedPrompter;
    use crate::runner::testing::MockRunner;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn quiet() -> Console {
        Console::new(true)
    }

    #[test]
    fn verify_fails_on_manifest_without_services() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::write(ctx.manifest_path(), "schema_version: \"1.0\"\n").unwrap();
        fs::write(ctx.versions_env_path(), "DK_ECR_REGISTRY=x\n").unwrap();
        let report = verify(&ctx);
        assert!(!report.ok());
        let invalid = &report.checks[1];
        assert!(!invalid.ok);
        assert!(invalid.message.contains("services"));
    }

    #[test]
    fn verify_missing_everything_reports_without_error() {
        let dir = tempdir().unwrap();
        let report = verify(&test_context(dir.path()));
        assert!(!report.ok());
        assert_eq!(report.checks.len(), 3);
    }

    #[test]
    fn compose_check_is_advisory() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let built =
            manifest::build_manifest(&BTreeMap::new(), "", "", RegistryConfig::default(), now());
        fs::write(ctx.manifest_path(), manifest::serialize(&built).unwrap()).unwrap();
        fs::write(ctx.versions_env_path(), "x").unwrap();
        fs::write(ctx.compose_path(), "services: {}\n").unwrap();
        let report = verify(&ctx);
        assert!(report.ok());
        assert!(!report.checks[3].ok);

        fs::write(ctx.compose_path(), "image: x:${DK_REQ_ROUTER_TAG}\n").unwrap();
        assert!(verify(&ctx).checks[3].ok);
    }

    #[test]
    fn unattended_migration_records_latest_when_nothing_runs() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            ..MigrateOptions::default()
        };
        let summary = run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).unwrap();
        assert_eq!(summary.detected, 0);
        assert!(summary.services.iter().all(|s| s.tag == "latest"));
        let written = manifest::read(&ctx.manifest_path()).unwrap();
        assert_eq!(written.deployment_id, "dkapp-20240501");
        let env = fs::read_to_string(ctx.versions_env_path()).unwrap();
        assert!(env.contains("DK_WSFE_TAG=latest"));
        assert!(env.contains("# Generated: 2024-05-01T12:00:00Z"));
        assert!(summary.backup.is_none());
    }

    #[test]
    fn interactive_migration_uses_detected_tags() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let runner = MockRunner::default();
        runner.push_stdout(0, r#"{"Service":"wsfe","ID":"abc","State":"running"}"#);
        runner.push_stdout(
            0,
            r#"[{"Config":{"Image":"public.ecr.aws/n5k3t9x2/wsfe:2.3.1"},"Image":"sha256:abc"}]"#,
        );
        let mut prompter = ScriptedPrompter::new(["y", "y", "acme", ""]);
        let summary = run_migrate(
            &ctx,
            &runner,
            &mut prompter,
            &quiet(),
            &MigrateOptions::default(),
            now(),
        )
        .unwrap();
        assert_eq!(summary.detected, 1);
        let written = manifest::read(&ctx.manifest_path()).unwrap();
        assert_eq!(written.customer_id, "acme");
        assert_eq!(written.services["wsfe"].current_tag, "2.3.1");
        assert_eq!(written.services["wsfe"].image_digest, "sha256:abc");
        assert_eq!(written.services["req_router"].current_tag, "latest");
        assert_eq!(prompter.remaining(), 0);
    }

    #[test]
    fn existing_manifest_requires_force_when_unattended() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::write(ctx.manifest_path(), "keep me").unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            ..MigrateOptions::default()
        };
        let err = run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).unwrap_err();
        assert!(matches!(err, DkError::Cancelled(_)));
        assert_eq!(fs::read_to_string(ctx.manifest_path()).unwrap(), "keep me");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn forced_migration_backs_up_previous_manifest() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::write(ctx.manifest_path(), "old: true\n").unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            force: true,
            customer_id: Some("acme".to_string()),
            deployment_id: Some("prod-1".to_string()),
        };
        let summary = run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).unwrap();
        let backup = summary.backup.expect("backup");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old: true\n");
        let written = manifest::read(&ctx.manifest_path()).unwrap();
        assert_eq!(written.deployment_id, "prod-1");
    }

    #[test]
    fn failed_write_restores_previous_manifest() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::write(ctx.manifest_path(), "old: true\n").unwrap();
        // A directory where versions.env should go makes the second write fail.
        fs::create_dir_all(ctx.versions_env_path().join("blocker")).unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            force: true,
            ..MigrateOptions::default()
        };
        assert!(run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).is_err());
        assert_eq!(fs::read_to_string(ctx.manifest_path()).unwrap(), "old: true\n");
    }

    #[test]
    fn failed_write_without_previous_manifest_leaves_nothing() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::create_dir_all(ctx.versions_env_path().join("blocker")).unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            force: true,
            ..MigrateOptions::default()
        };
        assert!(run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).is_err());
        assert!(!ctx.manifest_path().exists());
    }

    #[test]
    fn undo_restores_previous_content_or_removes_new_file() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("versions.env");
        let fresh = dir.path().join("version-manifest.yaml");
        fs::write(&existing, "DK_WSFE_TAG=1.0\n").unwrap();
        let existing_write = PendingWrite::begin(&existing).unwrap();
        let fresh_write = PendingWrite::begin(&fresh).unwrap();
        fs::write(&existing, "DK_WSFE_TAG=2.0\n").unwrap();
        fs::write(&fresh, "services: {}\n").unwrap();
        existing_write.undo();
        fresh_write.undo();
        assert_eq!(fs::read_to_string(&existing).unwrap(), "DK_WSFE_TAG=1.0\n");
        assert!(!fresh.exists());
    }

    #[test]
    fn successful_migration_drops_versions_env_backup() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        fs::write(ctx.versions_env_path(), "DK_WSFE_TAG=1.0\n").unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let options = MigrateOptions {
            yes: true,
            ..MigrateOptions::default()
        };
        run_migrate(&ctx, &runner, &mut prompter, &quiet(), &options, now()).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("versions.env.backup."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn pressing_enter_at_first_confirmation_cancels() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::new([""]);
        let err = run_migrate(
            &ctx,
            &runner,
            &mut prompter,
            &quiet(),
            &MigrateOptions::default(),
            now(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Migration cancelled");
        assert!(runner.calls().is_empty());
        assert!(!ctx.manifest_path().exists());
    }

    #[test]
    fn pressing_enter_at_detected_images_cancels() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let runner = MockRunner::default();
        runner.push_stdout(0, r#"{"Service":"wsfe","ID":"abc","State":"running"}"#);
        runner.push_stdout(
            0,
            r#"[{"Config":{"Image":"public.ecr.aws/n5k3t9x2/wsfe:2.3.1"},"Image":"sha256:abc"}]"#,
        );
        let mut prompter = ScriptedPrompter::new(["y", ""]);
        let err = run_migrate(
            &ctx,
            &runner,
            &mut prompter,
            &quiet(),
            &MigrateOptions::default(),
            now(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Migration cancelled");
        assert!(!ctx.manifest_path().exists());
    }

    #[test]
    fn declining_first_confirmation_cancels() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::new(["n"]);
        let err = run_migrate(
            &ctx,
            &runner,
            &mut prompter,
            &quiet(),
            &MigrateOptions::default(),
            now(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Migration cancelled");
        assert!(!ctx.manifest_path().exists());
    }
}
