mod config;
mod display;
mod envfile;
mod error;
mod fsutil;
mod inspector;
mod logging;
mod manifest;
mod prompt;
mod runner;
mod secrets;
mod workflow;

use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{build_context, read_config, Context, DEFAULT_CONFIG_YAML};
use display::{format_status, Console, Status};
use error::DkError;
use fsutil::write_atomic_text_file;
use prompt::TermPrompter;
use runner::SystemRunner;
use secrets::CleanupRegistry;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use workflow::install::{InstallOptions, Installer};
use workflow::migrate::{run_migrate, verify, MigrateOptions};
use workflow::print_checks;
use workflow::reconfigure::run_reconfigure;
use workflow::status::{collect_status, render_status};
use workflow::versions::{regenerate_versions_env, show_versions};

#[derive(Parser, Debug)]
#[command(name = "dkdeploy", version, about = "DagKnows deployment tool")]
struct Cli {
    /// Project directory (default: $DKDEPLOY_DIR, then the current directory)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare the host, capture the configuration and start every service
    Install {
        /// Skip the initial confirmation and resume without asking
        #[arg(long)]
        yes: bool,
        /// Ignore saved progress and start from the first step
        #[arg(long)]
        restart: bool,
    },
    /// Report the health of the deployment
    Status,
    /// Edit the encrypted configuration
    Reconfigure,
    /// Record running image versions in the version manifest
    Migrate {
        #[arg(long)]
        yes: bool,
        /// Overwrite an existing manifest without asking
        #[arg(long)]
        force: bool,
        #[arg(long)]
        customer_id: Option<String>,
        #[arg(long)]
        deployment_id: Option<String>,
    },
    /// Check the manifest and versions.env
    Verify,
    Versions {
        #[command(subcommand)]
        command: VersionsCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum VersionsCommand {
    /// Regenerate versions.env from the manifest
    Env,
    /// Print the effective tag of every service
    Show,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

fn main() -> Result<(), DkError> {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(cli.verbose) {
        eprintln!("{err}");
    }
    let json_output = cli.json;

    let result = build_context(cli.dir.as_ref(), cli.config.as_ref(), cli.json)
        .and_then(|ctx| dispatch(&ctx, cli.command));

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(err) => {
            if json_output {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{}", format_status(Status::Error, &err.to_string()));
            }
            std::process::exit(1);
        }
    }
}

/// Runs one command; `Ok(false)` means it completed but found problems.
fn dispatch(ctx: &Context, command: Commands) -> Result<bool, DkError> {
    let console = Console::new(ctx.json);
    match command {
        Commands::Install { yes, restart } => {
            reject_json(ctx, "install")?;
            let cleanup = signal_cleanup()?;
            let mut prompter = TermPrompter::new();
            Installer::new(ctx, &SystemRunner, &mut prompter, &console, &cleanup)
                .run(&InstallOptions { yes, restart })?;
            Ok(true)
        }
        Commands::Status => {
            let cleanup = signal_cleanup()?;
            let report = collect_status(ctx, &SystemRunner, &cleanup);
            let ok = report.ok();
            if ctx.json {
                print_json(&JsonResult {
                    ok,
                    error: (!ok).then(|| {
                        format!("{} of {} checks passed", report.passed, report.total)
                    }),
                    result: Some(report),
                })?;
            } else {
                render_status(&console, &report, &ctx.project_dir);
            }
            Ok(ok)
        }
        Commands::Reconfigure => {
            reject_json(ctx, "reconfigure")?;
            let cleanup = signal_cleanup()?;
            let mut prompter = TermPrompter::new();
            run_reconfigure(ctx, &SystemRunner, &mut prompter, &console, &cleanup)?;
            Ok(true)
        }
        Commands::Migrate {
            yes,
            force,
            customer_id,
            deployment_id,
        } => {
            let options = MigrateOptions {
                yes,
                force,
                customer_id,
                deployment_id,
            };
            let mut prompter = TermPrompter::new();
            let summary = run_migrate(ctx, &SystemRunner, &mut prompter, &console, &options, Utc::now())?;
            output(ctx, &summary)?;
            Ok(true)
        }
        Commands::Verify => {
            let report = verify(ctx);
            let ok = report.ok();
            if ctx.json {
                print_json(&JsonResult {
                    ok,
                    error: (!ok).then(|| "verification failed".to_string()),
                    result: Some(report),
                })?;
            } else {
                console.header("Verifying configuration");
                print_checks(&console, &report.checks);
                if ok {
                    console.status(Status::Success, "Configuration verified");
                } else {
                    console.status(Status::Error, "Verification failed");
                }
            }
            Ok(ok)
        }
        Commands::Versions { command } => match command {
            VersionsCommand::Env => {
                let path = regenerate_versions_env(ctx, &console, Utc::now())?;
                output(ctx, &json!({ "path": path }))?;
                Ok(true)
            }
            VersionsCommand::Show => {
                let rows = show_versions(ctx, &console)?;
                output(ctx, &rows)?;
                Ok(true)
            }
        },
        Commands::Config { command } => handle_config(ctx, &console, command),
    }
}

fn handle_config(ctx: &Context, console: &Console, command: ConfigCommand) -> Result<bool, DkError> {
    match command {
        ConfigCommand::Init => {
            let created = !ctx.config_path.exists();
            if created {
                write_atomic_text_file(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
                console.status(
                    Status::Success,
                    &format!("Created {}", ctx.config_path.display()),
                );
            } else {
                console.status(
                    Status::Info,
                    &format!("{} already exists", ctx.config_path.display()),
                );
            }
            output(ctx, &json!({ "path": ctx.config_path, "created": created }))?;
            Ok(true)
        }
        ConfigCommand::Validate => {
            if ctx.config_path.exists() {
                read_config(&ctx.config_path)?;
            }
            console.status(
                Status::Success,
                &format!("{} is valid", ctx.config_path.display()),
            );
            output(ctx, &json!({ "path": ctx.config_path, "valid": true }))?;
            Ok(true)
        }
    }
}

fn reject_json(ctx: &Context, command: &str) -> Result<(), DkError> {
    if ctx.json {
        return Err(DkError::Config(format!(
            "--json is not supported for the interactive `{command}` command"
        )));
    }
    Ok(())
}

fn signal_cleanup() -> Result<CleanupRegistry, DkError> {
    let cleanup = CleanupRegistry::default();
    cleanup.install_signal_handler()?;
    Ok(cleanup)
}

/// Prints the JSON envelope under `--json`; human output was already written
/// through the console.
fn output<T: Serialize>(ctx: &Context, payload: &T) -> Result<(), DkError> {
    if ctx.json {
        print_json(&JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        })?;
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), DkError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}
