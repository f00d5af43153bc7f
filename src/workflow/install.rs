//! `dkdeploy install`: resumable first-time installation.

use super::{ask_section, privileged, require_confirmation, running_as_root, CONFIG_SECTIONS};
use crate::config::Context;
use crate::display::{Console, Status};
use crate::envfile::{self, EnvMap, ENV_DEFAULT_TEMPLATE, INSTALL_HEADER};
use crate::error::DkError;
use crate::fsutil::write_atomic_text_file;
use crate::prompt::Prompter;
use crate::runner::{run_check, CommandRunner, Invocation};
use crate::secrets::{CleanupRegistry, PlaintextFile};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;

pub const STATE_FILE: &str = ".dkdeploy-install.yaml";
pub const ENV_DEFAULT_FILE: &str = ".env.default";
const PUBLIC_IP_URL: &str = "https://ifconfig.me";
const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStep {
    Preflight,
    SystemUpdate,
    Make,
    Prepare,
    RestartDocker,
    Configure,
    DockerGroup,
    Databases,
    Application,
}

impl InstallStep {
    pub const ALL: [InstallStep; 9] = [
        InstallStep::Preflight,
        InstallStep::SystemUpdate,
        InstallStep::Make,
        InstallStep::Prepare,
        InstallStep::RestartDocker,
        InstallStep::Configure,
        InstallStep::DockerGroup,
        InstallStep::Databases,
        InstallStep::Application,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InstallStep::Preflight => "preflight",
            InstallStep::SystemUpdate => "system-update",
            InstallStep::Make => "make",
            InstallStep::Prepare => "prepare",
            InstallStep::RestartDocker => "restart-docker",
            InstallStep::Configure => "configure",
            InstallStep::DockerGroup => "docker-group",
            InstallStep::Databases => "databases",
            InstallStep::Application => "application",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            InstallStep::Preflight => "Pre-flight Checks",
            InstallStep::SystemUpdate => "Updating System Packages",
            InstallStep::Make => "Installing Build Tools",
            InstallStep::Prepare => "Preparing Docker Environment",
            InstallStep::RestartDocker => "Restarting Docker Service",
            InstallStep::Configure => "Environment Configuration",
            InstallStep::DockerGroup => "Docker Group Configuration",
            InstallStep::Databases => "Starting Database Services",
            InstallStep::Application => "Starting Application Services",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallState {
    pub last_completed: InstallStep,
    pub updated_at: String,
    /// Application URL captured by the configure step, kept for resumed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

pub fn read_state(path: &Path) -> Result<Option<InstallState>, DkError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_yaml::from_str(&text)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn write_state(path: &Path, step: InstallStep, url: Option<&str>) -> Result<(), DkError> {
    let state = InstallState {
        last_completed: step,
        updated_at: crate::manifest::timestamp(Utc::now()),
        url: url.map(str::to_string),
    };
    write_atomic_text_file(path, &serde_yaml::to_string(&state)?)
}

pub fn clear_state(path: &Path) -> Result<(), DkError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Steps still to run after `last_completed`.
pub fn remaining_steps(last_completed: Option<InstallStep>) -> &'static [InstallStep] {
    let Some(last) = last_completed else {
        return &InstallStep::ALL;
    };
    let done = InstallStep::ALL
        .iter()
        .position(|step| *step == last)
        .map_or(0, |idx| idx + 1);
    &InstallStep::ALL[done..]
}

pub fn supported_os(os_release: &str) -> bool {
    let lowered = os_release.to_lowercase();
    lowered.contains("ubuntu") || lowered.contains("debian")
}

pub fn parse_public_ip(body: &str) -> Option<String> {
    body.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn fetch_public_ip(timeout: Duration) -> Result<String, DkError> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let body = client.get(PUBLIC_IP_URL).send()?.error_for_status()?.text()?;
    parse_public_ip(&body)
        .ok_or_else(|| DkError::Format(format!("unexpected response from {PUBLIC_IP_URL}")))
}

/// Best effort; any failure just means no suggested URL.
pub fn detect_public_ip(timeout: Duration) -> Option<String> {
    match fetch_public_ip(timeout) {
        Ok(ip) => Some(ip),
        Err(err) => {
            tracing::debug!(error = %err, "public ip detection failed");
            None
        }
    }
}

pub fn default_url(public_ip: Option<&str>) -> String {
    format!("https://{}", public_ip.unwrap_or("YOUR_IP_HERE"))
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub yes: bool,
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallSummary {
    pub completed: Vec<InstallStep>,
    pub resumed_after: Option<InstallStep>,
    pub url: Option<String>,
}

pub struct Installer<'a, R: ?Sized, P: ?Sized> {
    ctx: &'a Context,
    runner: &'a R,
    prompter: &'a mut P,
    console: &'a Console,
    cleanup: &'a CleanupRegistry,
    ip_lookup: fn(Duration) -> Option<String>,
    as_root: bool,
    url: Option<String>,
}

impl<'a, R, P> Installer<'a, R, P>
where
    R: CommandRunner + ?Sized,
    P: Prompter + ?Sized,
{
    pub fn new(
        ctx: &'a Context,
        runner: &'a R,
        prompter: &'a mut P,
        console: &'a Console,
        cleanup: &'a CleanupRegistry,
    ) -> Self {
        Self {
            ctx,
            runner,
            prompter,
            console,
            cleanup,
            ip_lookup: detect_public_ip,
            as_root: false,
            url: None,
        }
    }

    #[cfg(test)]
    pub fn with_ip_lookup(mut self, lookup: fn(Duration) -> Option<String>) -> Self {
        self.ip_lookup = lookup;
        self
    }

    fn cwd(&self) -> &Path {
        &self.ctx.project_dir
    }

    fn run_interactive(&self, invocation: Invocation) -> bool {
        run_check(self.runner, self.cwd(), &invocation).success
    }

    fn run_privileged(&self, invocation: Invocation) -> bool {
        self.run_interactive(privileged(invocation, self.as_root))
    }

    fn make(&self, target: &str) -> bool {
        self.run_interactive(Invocation::new("make").arg(target))
    }

    fn pause(&self, seconds: u64) {
        if seconds > 0 {
            thread::sleep(Duration::from_secs(seconds));
        }
    }

    pub fn run(mut self, options: &InstallOptions) -> Result<InstallSummary, DkError> {
        let console = self.console;
        console.header("DagKnows Installation Wizard");
        console.bold("This wizard will guide you through the installation of DagKnows");
        console.status(
            Status::Info,
            &format!("Working directory: {}", self.cwd().display()),
        );
        console.status(Status::Warning, "This wizard will:");
        console.line("  1. Update your system packages");
        console.line("  2. Install required dependencies (make, docker, etc.)");
        console.line("  3. Configure your DagKnows installation");
        console.line("  4. Start the application services");
        console.blank();

        if !options.yes {
            require_confirmation(
                &mut *self.prompter,
                "Do you want to continue?",
                false,
                "Installation cancelled by user",
            )?;
        }

        let state_path = self.ctx.project_file(STATE_FILE);
        let mut resumed_after = None;
        if options.restart {
            clear_state(&state_path)?;
        } else if let Some(state) = read_state(&state_path)? {
            let prompt = format!(
                "A previous installation completed step '{}'. Resume from the next step?",
                state.last_completed.name()
            );
            if options.yes || self.prompter.confirm(&prompt, true)? {
                resumed_after = Some(state.last_completed);
                self.url = state.url;
            } else {
                clear_state(&state_path)?;
            }
        }

        self.as_root = running_as_root(self.runner, self.cwd());
        if self.as_root {
            console.status(
                Status::Warning,
                "Running as root. Some commands will be run without sudo.",
            );
        }

        let mut completed = Vec::new();
        for step in remaining_steps(resumed_after) {
            console.header(step.title());
            tracing::debug!(step = step.name(), "running install step");
            if let Err(err) = self.run_step(*step) {
                console.status(Status::Error, &format!("Step '{}' failed", step.name()));
                console.status(
                    Status::Info,
                    "Fix the problem above and run `dkdeploy install` again to resume from this step",
                );
                return Err(err);
            }
            write_state(&state_path, *step, self.url.as_deref())?;
            completed.push(*step);
        }
        clear_state(&state_path)?;
        self.print_final_message();

        Ok(InstallSummary {
            completed,
            resumed_after,
            url: self.url,
        })
    }

    fn run_step(&mut self, step: InstallStep) -> Result<(), DkError> {
        match step {
            InstallStep::Preflight => self.preflight(),
            InstallStep::SystemUpdate => self.system_update(),
            InstallStep::Make => self.install_make(),
            InstallStep::Prepare => self.prepare(),
            InstallStep::RestartDocker => self.restart_docker(),
            InstallStep::Configure => self.configure(),
            InstallStep::DockerGroup => {
                self.docker_group();
                Ok(())
            }
            InstallStep::Databases => self.databases(),
            InstallStep::Application => self.application(),
        }
    }

    fn preflight(&self) -> Result<(), DkError> {
        self.console.status(Status::Info, "Checking operating system...");
        let os_release = fs::read_to_string(OS_RELEASE).unwrap_or_default();
        if supported_os(&os_release) {
            self.console
                .status(Status::Success, "Supported Linux distribution detected");
        } else {
            self.console.status(
                Status::Warning,
                "This installer is optimized for Ubuntu/Debian. Proceeding anyway...",
            );
        }

        self.console
            .status(Status::Info, "Checking internet connectivity...");
        let probe = Invocation::new("ping")
            .args(["-c", "1", "google.com"])
            .captured()
            .timeout(self.ctx.config.timeouts.connectivity());
        if !run_check(self.runner, self.cwd(), &probe).success {
            return Err(DkError::Process(
                "No internet connection detected; an internet connection is required for installation"
                    .to_string(),
            ));
        }
        self.console
            .status(Status::Success, "Internet connection verified");
        Ok(())
    }

    fn system_update(&self) -> Result<(), DkError> {
        self.console.status(Status::Info, "Running apt update...");
        if !self.run_privileged(Invocation::new("apt").arg("update")) {
            return Err(DkError::Process("Failed to run apt update".to_string()));
        }
        self.console
            .status(Status::Info, "Running apt upgrade... (This may take a while)");
        if !self.run_privileged(Invocation::new("apt").args(["upgrade", "-y"])) {
            self.console
                .status(Status::Warning, "apt upgrade had issues, but continuing...");
        }
        self.console.status(Status::Success, "System packages updated");
        Ok(())
    }

    fn install_make(&self) -> Result<(), DkError> {
        if which::which("make").is_ok() {
            self.console.status(Status::Success, "make is already installed");
            return Ok(());
        }
        self.console.status(Status::Info, "Installing make...");
        if !self.run_privileged(Invocation::new("apt-get").args(["install", "-y", "make"])) {
            return Err(DkError::Process("Failed to install make".to_string()));
        }
        self.console.status(Status::Success, "make installed successfully");
        Ok(())
    }

    fn prepare(&self) -> Result<(), DkError> {
        let template = self.ctx.project_file(ENV_DEFAULT_FILE);
        if !template.exists() {
            self.console
                .status(Status::Info, &format!("Creating {ENV_DEFAULT_FILE} file..."));
            write_atomic_text_file(&template, ENV_DEFAULT_TEMPLATE)?;
        }
        self.console.status(
            Status::Info,
            "Running 'make prepare'... (This may take several minutes)",
        );
        if !self.make("prepare") {
            return Err(DkError::Process(
                "Failed to prepare Docker environment".to_string(),
            ));
        }
        self.console
            .status(Status::Success, "Docker environment prepared successfully");
        Ok(())
    }

    fn restart_docker(&self) -> Result<(), DkError> {
        self.console.status(Status::Info, "Restarting Docker...");
        if !self.run_privileged(Invocation::new("systemctl").args(["restart", "docker"])) {
            return Err(DkError::Process("Failed to restart Docker".to_string()));
        }
        self.pause(self.ctx.config.install.docker_restart_delay_sec);
        self.console.status(Status::Success, "Docker restarted successfully");
        Ok(())
    }

    /// Prompts for the configuration; returns the full `.env` document.
    pub fn collect_configuration(&mut self) -> Result<EnvMap, DkError> {
        let console = self.console;
        let public_ip = (self.ip_lookup)(self.ctx.config.timeouts.probe());
        if let Some(ip) = &public_ip {
            console.status(Status::Info, &format!("Detected public IP: {ip}"));
        }
        console.status(Status::Info, "Please provide the following configuration values.");
        console.status(
            Status::Info,
            "Press Enter to keep default values (shown in brackets).",
        );
        let suggested_url = default_url(public_ip.as_deref());

        let mut answers = EnvMap::new();
        for (idx, section) in CONFIG_SECTIONS.iter().enumerate() {
            console.blank();
            console.bold(&format!("{}. {}", idx + 1, section.title));
            if let Some(note) = section.note {
                console.status(Status::Info, note);
            }
            ask_section(&mut *self.prompter, section, &mut answers, |field| {
                if field.key == "DAGKNOWS_URL" {
                    Some(suggested_url.clone())
                } else {
                    field.install_default.map(str::to_string)
                }
            })?;
        }
        let mut values = envfile::merge_defaults(&answers);
        envfile::sync_default_org(&mut values);
        Ok(values)
    }

    fn configure(&mut self) -> Result<(), DkError> {
        let values = self.collect_configuration()?;
        self.url = values.get("DAGKNOWS_URL").cloned();

        let console = self.console;
        console.status(Status::Info, "Creating .env file...");
        let scope = PlaintextFile::create(
            self.cleanup,
            &self.ctx.env_plain_path(),
            &envfile::serialize(&values, INSTALL_HEADER),
        )?;
        console.status(Status::Success, ".env file created");

        console.header("Encrypting Configuration");
        console.status(Status::Info, "Your .env file will now be encrypted using GPG.");
        console.status(
            Status::Warning,
            "Remember this password! You'll need it for 'make updb' and 'make up' commands.",
        );
        let encrypted = self.make("encrypt");
        drop(scope);
        if !encrypted {
            return Err(DkError::Process("Failed to encrypt configuration".to_string()));
        }
        console.status(Status::Success, "Configuration encrypted successfully");
        Ok(())
    }

    fn current_user(&self) -> Option<String> {
        if let Ok(user) = std::env::var("USER") {
            if !user.trim().is_empty() {
                return Some(user);
            }
        }
        let outcome = run_check(self.runner, self.cwd(), &Invocation::new("whoami").captured());
        Some(outcome.output).filter(|user| outcome.success && !user.is_empty())
    }

    /// Never fails the install; membership is usually set by `make prepare`.
    fn docker_group(&self) {
        let console = self.console;
        let groups = run_check(self.runner, self.cwd(), &Invocation::new("groups").captured());
        if groups.success && groups.output.split_whitespace().any(|g| g == "docker") {
            console.status(Status::Success, "User is already in docker group");
            return;
        }
        let Some(user) = self.current_user() else {
            console.status(
                Status::Warning,
                "Could not determine the current user, skipping docker group setup",
            );
            return;
        };
        console.status(Status::Info, &format!("Adding user '{user}' to docker group..."));
        if self.run_privileged(Invocation::new("usermod").args(["-aG", "docker"]).arg(user)) {
            console.status(Status::Success, "User added to docker group");
            console.status(
                Status::Warning,
                "Note: You may need to log out and back in for group changes to take effect",
            );
        } else {
            console.status(
                Status::Warning,
                "Could not add user to docker group, but continuing...",
            );
        }
    }

    fn databases(&self) -> Result<(), DkError> {
        let console = self.console;
        let timing = &self.ctx.config.install;
        console.status(
            Status::Info,
            "This will start PostgreSQL and Elasticsearch containers.",
        );
        console.status(Status::Warning, "This command may prompt for your encryption password.");
        if !self.make("updb") {
            return Err(DkError::Process("Failed to start database services".to_string()));
        }
        console.status(Status::Success, "Database services started");

        console.status(Status::Info, "Showing database logs...");
        let preview = Invocation::new("timeout")
            .arg(timing.dblogs_preview_sec.to_string())
            .args(["make", "dblogs"]);
        // Exits non-zero when the preview window ends; only the interrupt matters.
        self.cleanup
            .tolerating_interrupt(|| run_check(self.runner, self.cwd(), &preview));
        if self.cleanup.take_interrupt() {
            console.status(Status::Info, "Logs interrupted by user");
        }
        console.status(Status::Info, "Waiting for databases to settle...");
        self.pause(timing.database_stabilize_delay_sec);
        Ok(())
    }

    fn application(&self) -> Result<(), DkError> {
        let console = self.console;
        console.status(Status::Info, "This will start all DagKnows application containers.");
        console.status(Status::Warning, "This command may prompt for your encryption password.");
        if !self.make("up") {
            return Err(DkError::Process(
                "Failed to start application services".to_string(),
            ));
        }
        console.status(Status::Success, "Application services started");
        console.status(Status::Info, "Starting application logs...");
        console.status(Status::Info, "Press Ctrl+C to stop viewing logs");
        self.cleanup.tolerating_interrupt(|| self.make("logs"));
        if self.cleanup.take_interrupt() {
            console.status(Status::Info, "Logs stopped by user");
        }
        Ok(())
    }

    fn print_final_message(&self) {
        let console = self.console;
        console.header("Installation Complete!");
        console.status(Status::Success, "DagKnows has been successfully installed!");
        console.blank();
        match &self.url {
            Some(url) => {
                console.bold("Access your DagKnows instance at:");
                console.command_hint(url);
            }
            None => console.bold("Access your DagKnows instance at the DAGKNOWS_URL you configured."),
        }
        console.blank();
        console.bold("Useful commands:");
        for (command, purpose) in [
            ("make logs", "View application logs"),
            ("make dblogs", "View database logs"),
            ("make down", "Stop all services"),
            ("make up", "Start application services"),
            ("make updb", "Start database services"),
            ("make restart", "Restart all services"),
            ("dkdeploy status", "Check deployment health"),
        ] {
            console.command_hint(&format!("{command:<16} - {purpose}"));
        }
        console.blank();
        console.status(
            Status::Warning,
            "Note: Some commands will prompt for your encryption password",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_context;
    use crate::prompt::testing::ScriptedPrompter;
    use crate::runner::testing::MockRunner;
    use tempfile::tempdir;

    fn no_ip(_: Duration) -> Option<String> {
        None
    }

    fn fixed_ip(_: Duration) -> Option<String> {
        Some("203.0.113.7".to_string())
    }

    fn fast_context(dir: &Path) -> Context {
        let mut ctx = test_context(dir);
        ctx.config.install.docker_restart_delay_sec = 0;
        ctx.config.install.database_stabilize_delay_sec = 0;
        ctx
    }

    /// Answers for every configuration prompt, taking defaults where offered.
    fn config_answers() -> Vec<&'static str> {
        vec![
            "",            // url
            "dbpass",      // db password
            "dbpass",      // confirm
            "",            // super user email
            "",            // first name
            "",            // last name
            "supersecret", // super password
            "supersecret", // confirm
            "acme",        // org
            "", "", "", "", // mail
            "", "",        // openai
        ]
    }

    #[test]
    fn remaining_steps_resume_after_last_completed() {
        assert_eq!(remaining_steps(None).len(), 9);
        let rest = remaining_steps(Some(InstallStep::Configure));
        assert_eq!(
            rest,
            &[
                InstallStep::DockerGroup,
                InstallStep::Databases,
                InstallStep::Application
            ]
        );
        assert!(remaining_steps(Some(InstallStep::Application)).is_empty());
    }

    #[test]
    fn state_round_trips_with_kebab_case_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);
        assert!(read_state(&path).unwrap().is_none());
        write_state(&path, InstallStep::RestartDocker, None).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("last_completed: restart-docker"));
        let state = read_state(&path).unwrap().unwrap();
        assert_eq!(state.last_completed, InstallStep::RestartDocker);
        clear_state(&path).unwrap();
        clear_state(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn os_and_ip_helpers() {
        assert!(supported_os("NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\""));
        assert!(supported_os("ID=debian"));
        assert!(!supported_os("ID=fedora"));
        assert_eq!(parse_public_ip("203.0.113.7\n").as_deref(), Some("203.0.113.7"));
        assert!(parse_public_ip("<html>").is_none());
        assert_eq!(default_url(None), "https://YOUR_IP_HERE");
    }

    #[test]
    fn configuration_merges_defaults_and_syncs_org() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::new(config_answers());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        let mut installer =
            Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup).with_ip_lookup(fixed_ip);
        let values = installer.collect_configuration().unwrap();
        assert_eq!(values["DAGKNOWS_URL"], "https://203.0.113.7");
        assert_eq!(values["SUPER_USER"], "admin@example.com");
        assert_eq!(values["SUPER_USER_ORG"], "acme");
        assert_eq!(values["DEFAULT_ORG"], "acme");
        assert_eq!(values["MAIL_DEFAULT_SENDER"], "info@dagknows.com");
        assert_eq!(values["POSTGRESQL_DB_HOST"], "postgres");
        assert_eq!(values.get_index(0).unwrap().0, "APP_SECRET_KEY");
    }

    #[test]
    fn full_install_runs_make_targets_in_order_and_clears_state() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::new(config_answers());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        let summary = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(no_ip)
            .run(&InstallOptions {
                yes: true,
                restart: false,
            })
            .unwrap();
        assert_eq!(summary.completed.len(), 9);
        assert_eq!(summary.url.as_deref(), Some("https://YOUR_IP_HERE"));

        let make_calls: Vec<String> = runner
            .rendered_calls()
            .into_iter()
            .filter(|call| call.starts_with("make ") || call.starts_with("timeout "))
            .collect();
        assert_eq!(
            make_calls,
            vec![
                "make prepare",
                "make encrypt",
                "make updb",
                "timeout 10 make dblogs",
                "make up",
                "make logs"
            ]
        );
        let rendered = runner.rendered_calls();
        assert!(rendered.contains(&"sudo apt update".to_string()));
        assert!(rendered.contains(&"sudo systemctl restart docker".to_string()));
        assert!(dir.path().join(ENV_DEFAULT_FILE).exists());
        assert!(!ctx.env_plain_path().exists());
        assert!(!dir.path().join(STATE_FILE).exists());
    }

    #[test]
    fn failed_step_records_progress_and_resume_skips_done_steps() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();

        // id -u, ping, apt update fails.
        let runner = MockRunner::default();
        runner.push_stdout(0, "1000");
        runner.push_stdout(0, "");
        runner.push_stdout(100, "");
        let mut prompter = ScriptedPrompter::default();
        let err = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(no_ip)
            .run(&InstallOptions {
                yes: true,
                restart: false,
            })
            .unwrap_err();
        assert!(err.to_string().contains("apt update"));
        let state = read_state(&dir.path().join(STATE_FILE)).unwrap().unwrap();
        assert_eq!(state.last_completed, InstallStep::Preflight);

        // Second run: confirm resume, then everything succeeds.
        let runner = MockRunner::default();
        let mut answers = vec!["y", "y"];
        answers.extend(config_answers());
        let mut prompter = ScriptedPrompter::new(answers);
        let summary = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(no_ip)
            .run(&InstallOptions::default())
            .unwrap();
        assert_eq!(summary.resumed_after, Some(InstallStep::Preflight));
        assert_eq!(summary.completed.first(), Some(&InstallStep::SystemUpdate));
        assert!(!runner.rendered_calls().iter().any(|call| call.starts_with("ping")));
    }

    #[test]
    fn resumed_run_reports_url_captured_before_the_failure() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        let state_path = dir.path().join(STATE_FILE);
        write_state(&state_path, InstallStep::Configure, Some("https://203.0.113.7")).unwrap();
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::default();
        let summary = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(no_ip)
            .run(&InstallOptions {
                yes: true,
                restart: false,
            })
            .unwrap();
        assert_eq!(summary.resumed_after, Some(InstallStep::Configure));
        assert_eq!(summary.url.as_deref(), Some("https://203.0.113.7"));
    }

    #[test]
    fn configure_step_records_url_in_state() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let state_path = dir.path().join(STATE_FILE);
        write_state(&state_path, InstallStep::RestartDocker, None).unwrap();
        // id -u, make encrypt, groups, then make updb fails.
        let runner = MockRunner::default();
        runner.push_stdout(0, "1000");
        runner.push_stdout(0, "");
        runner.push_stdout(0, "docker");
        runner.push_stdout(2, "");
        let mut prompter = ScriptedPrompter::new(config_answers());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(fixed_ip)
            .run(&InstallOptions {
                yes: true,
                restart: false,
            })
            .unwrap_err();
        let state = read_state(&state_path).unwrap().unwrap();
        assert_eq!(state.last_completed, InstallStep::DockerGroup);
        assert_eq!(state.url.as_deref(), Some("https://203.0.113.7"));
    }

    #[test]
    fn failed_encryption_removes_plaintext_env() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        write_state(&dir.path().join(STATE_FILE), InstallStep::RestartDocker, None).unwrap();
        let runner = MockRunner::default();
        runner.push_stdout(0, "1000"); // id -u
        runner.push_stdout(2, ""); // make encrypt
        let mut prompter = ScriptedPrompter::new(config_answers());
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        let err = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .with_ip_lookup(no_ip)
            .run(&InstallOptions {
                yes: true,
                restart: false,
            })
            .unwrap_err();
        assert!(err.to_string().contains("encrypt"));
        assert!(!ctx.env_plain_path().exists());
        let state = read_state(&dir.path().join(STATE_FILE)).unwrap().unwrap();
        assert_eq!(state.last_completed, InstallStep::RestartDocker);
    }

    #[test]
    fn declining_the_wizard_cancels_before_any_command() {
        let dir = tempdir().unwrap();
        let ctx = fast_context(dir.path());
        let runner = MockRunner::default();
        let mut prompter = ScriptedPrompter::new(["n"]);
        let console = Console::new(true);
        let cleanup = CleanupRegistry::default();
        let err = Installer::new(&ctx, &runner, &mut prompter, &console, &cleanup)
            .run(&InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, DkError::Cancelled(_)));
        assert!(runner.calls().is_empty());
    }
}
