//! Operator-facing status lines. Formatting is pure; callers decide where the
//! string goes.

use dialoguer::console::style;

const RULE_WIDTH: usize = 60;
const DOT_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Warning,
    Info,
    Step,
}

impl Status {
    fn symbol(self) -> &'static str {
        match self {
            Status::Success => "\u{2713}",
            Status::Error => "\u{2717}",
            Status::Warning => "\u{26a0}",
            Status::Info => "\u{2139}",
            Status::Step => ">>>",
        }
    }
}

pub fn format_status(status: Status, text: &str) -> String {
    let line = format!("{} {}", status.symbol(), text);
    match status {
        Status::Success => style(line).green().to_string(),
        Status::Error => style(line).red().to_string(),
        Status::Warning => style(line).yellow().to_string(),
        Status::Info => style(line).blue().to_string(),
        Status::Step => style(line).blue().bold().to_string(),
    }
}

pub fn format_header(text: &str) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let title = format!("{text:^RULE_WIDTH$}");
    format!(
        "{}\n{}\n{}",
        style(&rule).magenta().bold(),
        style(title).magenta().bold(),
        style(&rule).magenta().bold()
    )
}

/// `name....... OK` with an optional indented remediation line.
pub fn format_check(name: &str, ok: bool, message: &str) -> String {
    let (symbol, verdict) = if ok {
        (style("\u{2713}").green(), style("OK").green())
    } else {
        (style("\u{2717}").red(), style("FAILED").red())
    };
    let mut line = format!("{symbol} {name:.<DOT_WIDTH$} {verdict}");
    if !message.is_empty() {
        line.push('\n');
        line.push_str(&style(format!("  \u{2192} {message}")).yellow().to_string());
    }
    line
}

/// Version table row; `marker` is appended verbatim (e.g. `[custom]`).
pub fn format_version_row(ok: bool, service: &str, tag: &str, marker: &str) -> String {
    let symbol = if ok {
        style("\u{2713}").green()
    } else {
        style("?").yellow()
    };
    let row = format!("  {symbol} {service:.<40} {tag:<15}");
    if marker.is_empty() {
        row.trim_end().to_string()
    } else {
        format!("{row} {marker}")
    }
}

/// Stdout sink for operator output; quiet under `--json` so only the JSON
/// payload reaches stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    quiet: bool,
}

impl Console {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn line(&self, text: &str) {
        if !self.quiet {
            println!("{text}");
        }
    }

    pub fn blank(&self) {
        self.line("");
    }

    pub fn status(&self, status: Status, text: &str) {
        self.line(&format_status(status, text));
    }

    pub fn header(&self, text: &str) {
        self.blank();
        self.line(&format_header(text));
        self.blank();
    }

    pub fn step(&self, text: &str) {
        self.blank();
        self.status(Status::Step, text);
    }

    pub fn bold(&self, text: &str) {
        self.line(&style(text).bold().to_string());
    }

    /// Indented command the operator is expected to run.
    pub fn command_hint(&self, command: &str) {
        self.line(&format!("  {}", style(command).cyan()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialoguer::console::strip_ansi_codes;

    #[test]
    fn status_lines_carry_their_symbol() {
        let line = format_status(Status::Success, "Created versions.env");
        assert_eq!(strip_ansi_codes(&line), "\u{2713} Created versions.env");
        let line = format_status(Status::Error, "boom");
        assert_eq!(strip_ansi_codes(&line), "\u{2717} boom");
        let line = format_status(Status::Step, "Detecting");
        assert_eq!(strip_ansi_codes(&line), ">>> Detecting");
    }

    #[test]
    fn check_line_pads_name_with_dots() {
        let line = format_check("Docker installed", true, "");
        let plain = strip_ansi_codes(&line).to_string();
        assert!(plain.starts_with("\u{2713} Docker installed...."));
        assert!(plain.ends_with(" OK"));
        assert_eq!(plain.chars().count(), 2 + DOT_WIDTH + 3);
    }

    #[test]
    fn failed_check_includes_remediation() {
        let line = format_check("Docker running", false, "Run: sudo systemctl start docker");
        let plain = strip_ansi_codes(&line).to_string();
        let mut lines = plain.lines();
        assert!(lines.next().unwrap().ends_with("FAILED"));
        assert_eq!(
            lines.next().unwrap(),
            "  \u{2192} Run: sudo systemctl start docker"
        );
    }

    #[test]
    fn header_is_centered_between_rules() {
        let header = format_header("Summary");
        let plain = strip_ansi_codes(&header).to_string();
        let lines: Vec<&str> = plain.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "=".repeat(RULE_WIDTH));
        assert_eq!(lines[1].trim(), "Summary");
        assert_eq!(lines[1].len(), RULE_WIDTH);
    }

    #[test]
    fn version_row_marks_overrides() {
        let row = format_version_row(true, "wsfe", "v2", "[custom]");
        let plain = strip_ansi_codes(&row).to_string();
        assert!(plain.contains("wsfe...."));
        assert!(plain.ends_with("[custom]"));
    }
}
