//! `dkdeploy status`: a read-only health report of the deployment.

use super::{check, print_checks, Check};
use crate::config::Context;
use crate::display::{format_version_row, Console, Status};
use crate::envfile;
use crate::inspector::{ok_rows, ComposePsRow, Inspector};
use crate::manifest;
use crate::runner::{run_check, CommandRunner, Invocation};
use crate::secrets::{decrypt_batch, CleanupRegistry, PlaintextFile};
use dialoguer::console::style;
use serde::Serialize;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

pub const NETWORK_NAME: &str = "saaslocalnetwork";
pub const DATA_DIRS: [&str; 3] = ["postgres-data", "esdata1", "elastic_backup"];
pub const EXPECTED_CONTAINERS: [&str; 12] = [
    "postgres",
    "elasticsearch",
    "nginx",
    "req-router",
    "taskservice",
    "wsfe",
    "settings",
    "dagknows-nuxt",
    "conv-mgr",
    "apigateway",
    "ansi-processing",
    "jobsched",
];
pub const PORTS: [(u16, &str); 2] = [(80, "HTTP"), (443, "HTTPS")];
const URL_SCRATCH_FILE: &str = ".env.status.tmp";

#[derive(Debug, Clone, Serialize)]
pub struct StatusSection {
    pub id: &'static str,
    pub title: &'static str,
    pub ok: bool,
    pub checks: Vec<Check>,
    pub notes: Vec<String>,
}

impl StatusSection {
    fn new(id: &'static str, title: &'static str) -> Self {
        Self {
            id,
            title,
            ok: true,
            checks: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn push(&mut self, item: Check) -> bool {
        let ok = item.ok;
        if !ok {
            self.ok = false;
        }
        self.checks.push(item);
        ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    Manifest,
    Detected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionLine {
    pub service: String,
    pub tag: String,
    pub custom: bool,
    pub deployed_at: String,
    pub source: VersionSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub sections: Vec<StatusSection>,
    pub versions: Vec<VersionLine>,
    pub passed: usize,
    pub total: usize,
    pub url: Option<String>,
}

impl StatusReport {
    pub fn ok(&self) -> bool {
        self.passed == self.total
    }

    fn section_ok(&self, id: &str) -> bool {
        self.sections
            .iter()
            .find(|section| section.id == id)
            .map_or(false, |section| section.ok)
    }
}

pub fn check_required_files(ctx: &Context) -> StatusSection {
    let files = &ctx.config.files;
    let required = [
        ("Makefile", "Makefile for running commands"),
        (files.compose.as_str(), "Main application compose file"),
        (files.db_compose.as_str(), "Database compose file"),
        ("nginx.conf", "Nginx configuration"),
        (files.env_encrypted.as_str(), "Encrypted environment file"),
    ];
    let mut section = StatusSection::new("files", "Required Files Check");
    for (name, description) in required {
        let exists = ctx.project_file(name).is_file();
        section.push(check(
            format!("{name} ({description})"),
            exists,
            if exists { "" } else { "File not found" },
        ));
    }
    section
}

pub fn check_docker<R: CommandRunner + ?Sized>(ctx: &Context, runner: &R) -> StatusSection {
    let probes = [
        ("Docker installed", vec!["--version"], "Run: sudo apt-get install docker.io"),
        ("Docker running", vec!["ps"], "Run: sudo systemctl start docker"),
        (
            "Docker Compose installed",
            vec!["compose", "version"],
            "Run: sudo apt-get install docker-compose-v2",
        ),
    ];
    let mut section = StatusSection::new("docker", "Docker Check");
    for (name, args, remediation) in probes {
        let invocation = Invocation::new("docker")
            .args(args)
            .captured()
            .timeout(ctx.config.timeouts.probe());
        let ok = run_check(runner, &ctx.project_dir, &invocation).success;
        if !section.push(check(name, ok, if ok { "" } else { remediation })) {
            break;
        }
    }
    section
}

pub fn check_network<R: CommandRunner + ?Sized>(ctx: &Context, runner: &R) -> StatusSection {
    let mut section = StatusSection::new("network", "Docker Network Check");
    let invocation = Invocation::new("docker")
        .args(["network", "ls", "--format", "{{.Name}}"])
        .captured()
        .timeout(ctx.config.timeouts.probe());
    let outcome = run_check(runner, &ctx.project_dir, &invocation);
    let exists = outcome.success && outcome.output.lines().any(|line| line.trim() == NETWORK_NAME);
    let remediation = if !outcome.success {
        "Unable to list docker networks".to_string()
    } else if !exists {
        format!("Run: docker network create {NETWORK_NAME}")
    } else {
        String::new()
    };
    section.push(check(format!("{NETWORK_NAME} exists"), exists, remediation));
    section
}

pub fn check_data_directories(ctx: &Context) -> StatusSection {
    let mut section = StatusSection::new("data_dirs", "Data Directories Check");
    for dir in DATA_DIRS {
        let exists = ctx.project_file(dir).is_dir();
        section.push(check(dir, exists, if exists { "" } else { "Run: make dbdirs" }));
    }
    section
}

fn health_suffix(row: &ComposePsRow) -> String {
    if row.health.is_empty() {
        String::new()
    } else {
        format!(" ({})", row.health)
    }
}

pub fn check_database_containers<R: CommandRunner + ?Sized>(
    ctx: &Context,
    inspector: &Inspector<'_, R>,
) -> StatusSection {
    let mut section = StatusSection::new("db_containers", "Database Container Check");
    let Some(text) = inspector.compose_ps(Some(&ctx.config.files.db_compose)) else {
        section.push(check("Database containers", false, "Run: make updb"));
        return section;
    };
    let rows = ok_rows(&text);
    for (service, label) in [("postgres", "PostgreSQL"), ("elasticsearch", "Elasticsearch")] {
        match rows.iter().find(|row| row.service == service) {
            Some(row) => {
                let running = row.is_running();
                section.push(check(
                    format!("{label}{}", health_suffix(row)),
                    running,
                    if running {
                        String::new()
                    } else {
                        format!("State: {}. Run: make updb", row.state)
                    },
                ));
            }
            None => {
                section.push(check(label, false, "Container not found. Run: make updb"));
            }
        }
    }
    section
}

pub fn check_app_containers<R: CommandRunner + ?Sized>(inspector: &Inspector<'_, R>) -> StatusSection {
    let mut section = StatusSection::new("containers", "Container Status Check");
    let Some(text) = inspector.compose_ps(None) else {
        section.push(check(
            "No containers running",
            false,
            "Services not started. Run: make updb && make up",
        ));
        return section;
    };
    let rows = ok_rows(&text);
    for row in rows
        .iter()
        .filter(|row| EXPECTED_CONTAINERS.contains(&row.service.as_str()))
    {
        let running = row.is_running();
        section.push(check(
            format!("{} container{}", row.service, health_suffix(row)),
            running,
            if running {
                String::new()
            } else {
                format!("State: {}", row.state)
            },
        ));
    }
    let missing: Vec<&str> = EXPECTED_CONTAINERS
        .iter()
        .copied()
        .filter(|expected| !rows.iter().any(|row| row.service == *expected))
        .collect();
    if !missing.is_empty() {
        section.ok = false;
        section.notes.push(format!("Missing services: {}", missing.join(", ")));
    }
    section
}

pub fn port_open(addr: SocketAddr, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

pub fn check_ports(ctx: &Context) -> StatusSection {
    let mut section = StatusSection::new("ports", "Port Accessibility Check");
    for (port, description) in PORTS {
        let open = port_open(
            SocketAddr::from(([127, 0, 0, 1], port)),
            ctx.config.timeouts.connectivity(),
        );
        section.push(check(
            format!("Port {port} ({description})"),
            open,
            if open { "" } else { "Port not accessible" },
        ));
    }
    section
}

pub fn check_versions<R: CommandRunner + ?Sized>(
    ctx: &Context,
    inspector: &Inspector<'_, R>,
) -> (StatusSection, Vec<VersionLine>) {
    let mut section = StatusSection::new("versions", "Installed Versions");
    let path = ctx.manifest_path();
    if !path.exists() {
        section.push(check(
            "Version tracking enabled",
            false,
            "Run: dkdeploy migrate",
        ));
        let lines = inspector
            .list_running_services()
            .into_values()
            .map(|observation| VersionLine {
                service: observation.service_id,
                tag: observation.tag,
                custom: false,
                deployed_at: String::new(),
                source: VersionSource::Detected,
            })
            .collect();
        return (section, lines);
    }
    match manifest::read(&path) {
        Ok(manifest) => {
            section.push(check("Version manifest readable", true, ""));
            let lines = manifest
                .services
                .iter()
                .map(|(service, record)| VersionLine {
                    service: service.clone(),
                    tag: manifest.effective_tag(service),
                    custom: manifest.override_tag(service).is_some(),
                    deployed_at: record.deployed_at.chars().take(10).collect(),
                    source: VersionSource::Manifest,
                })
                .collect();
            (section, lines)
        }
        Err(err) => {
            section.push(check(
                "Version manifest readable",
                false,
                format!("Error reading manifest: {err}"),
            ));
            (section, Vec::new())
        }
    }
}

/// Reads `DAGKNOWS_URL` through a non-interactive decrypt. `None` when no
/// cached passphrase is available.
pub fn read_application_url<R: CommandRunner + ?Sized>(
    ctx: &Context,
    runner: &R,
    cleanup: &CleanupRegistry,
) -> Option<String> {
    let encrypted = ctx.env_encrypted_path();
    if !encrypted.exists() {
        return None;
    }
    let scratch = PlaintextFile::adopt(cleanup, &ctx.project_file(URL_SCRATCH_FILE));
    if !decrypt_batch(runner, &ctx.project_dir, &encrypted, &scratch, ctx.config.timeouts.probe()) {
        return None;
    }
    let text = scratch.read().ok()?;
    envfile::lookup(&text, "DAGKNOWS_URL").filter(|url| !url.is_empty())
}

pub fn collect_status<R: CommandRunner + ?Sized>(
    ctx: &Context,
    runner: &R,
    cleanup: &CleanupRegistry,
) -> StatusReport {
    let mut sections = vec![check_required_files(ctx)];
    let docker = check_docker(ctx, runner);
    let docker_ok = docker.ok;
    sections.push(docker);

    let mut versions = Vec::new();
    if docker_ok {
        let inspector = Inspector::new(runner, &ctx.project_dir, ctx.config.timeouts.probe());
        sections.push(check_network(ctx, runner));
        sections.push(check_data_directories(ctx));
        sections.push(check_database_containers(ctx, &inspector));
        sections.push(check_app_containers(&inspector));
        sections.push(check_ports(ctx));
        let inspect_timeout = ctx.config.timeouts.inspect();
        let version_inspector = Inspector::new(runner, &ctx.project_dir, inspect_timeout);
        let (section, lines) = check_versions(ctx, &version_inspector);
        sections.push(section);
        versions = lines;
    }

    let total = sections.len();
    let passed = sections.iter().filter(|section| section.ok).count();
    let url = if passed == total {
        read_application_url(ctx, runner, cleanup)
    } else {
        None
    };
    StatusReport {
        sections,
        versions,
        passed,
        total,
        url,
    }
}

fn render_versions(console: &Console, report: &StatusReport) {
    for line in &report.versions {
        let marker = match line.source {
            VersionSource::Manifest if line.custom => style("[custom]").yellow().to_string(),
            VersionSource::Manifest if !line.deployed_at.is_empty() => format!("({})", line.deployed_at),
            _ => String::new(),
        };
        let ok = line.source == VersionSource::Manifest;
        console.line(&format_version_row(ok, &line.service, &line.tag, &marker));
    }
}

pub fn render_status(console: &Console, report: &StatusReport, project_dir: &Path) {
    console.header("DagKnows Status Check");
    console.bold(&format!(
        "Checking DagKnows installation status in {}...",
        project_dir.display()
    ));
    for section in &report.sections {
        console.header(section.title);
        print_checks(console, &section.checks);
        for note in &section.notes {
            console.blank();
            console.status(Status::Warning, note);
        }
        if section.id == "versions" {
            if !report.versions.is_empty()
                && report.versions[0].source == VersionSource::Detected
            {
                console.line("  Detected from running containers:");
            }
            render_versions(console, report);
        }
    }

    console.header("Summary");
    if report.ok() {
        console.status(Status::Success, "All checks passed!");
        console.line("Your DagKnows installation appears to be working correctly.");
        if let Some(url) = &report.url {
            console.blank();
            console.line(&format!("Access your instance at: {}", style(url).bold()));
        }
        return;
    }
    console.status(
        Status::Warning,
        &format!("Checks: {}/{} passed", report.passed, report.total),
    );
    console.status(
        Status::Error,
        "Some issues were detected. Please review the output above.",
    );
    console.blank();
    console.bold("Common fixes:");
    let fixes = [
        ("docker", "Install/start Docker: sudo systemctl start docker"),
        ("files", "Run the installation wizard: dkdeploy install"),
        ("db_containers", "Start database services: make updb"),
        ("containers", "Start application services: make up"),
        ("versions", "Enable version tracking: dkdeploy migrate"),
    ];
    for (id, fix) in fixes {
        // Sections skipped after a docker failure count as failed here.
        if !report.section_ok(id) {
            console.line(&format!("  - {fix}"));
        }
    }
}
