//! Terminal output: status macros and report formatting.
use std::fmt::Write as _;

pub use colored::Color;
use colored::Colorize;
use serde_derive::Deserialize;

use crate::model::ScanReport;

/// Prints a warning, unless greppable. Accessible mode drops the marker.
#[macro_export]
macro_rules! warning {
    ($name:expr) => {
        println!("{} {}", $crate::tui::marker("[!]", $crate::tui::Color::Red), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::marker("[!]", $crate::tui::Color::Red), $name);
            }
        }
    };
}

#[macro_export]
macro_rules! detail {
    ($name:expr) => {
        println!("{} {}", $crate::tui::marker("[~]", $crate::tui::Color::Blue), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::marker("[~]", $crate::tui::Color::Blue), $name);
            }
        }
    };
}

#[macro_export]
macro_rules! output {
    ($name:expr) => {
        println!("{} {}", $crate::tui::marker("[>]", $crate::tui::Color::Green), $name);
    };
    ($name:expr, $greppable:expr, $accessible:expr) => {
        if !$greppable {
            if $accessible {
                println!("{}", $name);
            } else {
                println!("{} {}", $crate::tui::marker("[>]", $crate::tui::Color::Green), $name);
            }
        }
    };
}

#[doc(hidden)]
pub fn marker(text: &str, color: Color) -> colored::ColoredString {
    text.color(color).bold()
}

/// How finished reports are written to stdout.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    /// One `ip -> [ports]` line per target.
    Greppable,
    Json,
}

const BANNER_PREVIEW_CHARS: usize = 60;

pub fn format_reports(
    reports: &[ScanReport],
    format: OutputFormat,
    accessible: bool,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(reports),
        OutputFormat::Greppable => Ok(reports.iter().map(greppable).collect::<Vec<_>>().join("\n")),
        OutputFormat::Human => Ok(reports
            .iter()
            .map(|report| human(report, accessible))
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

fn greppable(report: &ScanReport) -> String {
    let ports = report
        .open_port_numbers()
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!("{} -> [{ports}]", report.target.address)
}

fn human(report: &ScanReport, accessible: bool) -> String {
    let title = format!("Report for {}", report.target);
    let mut text = if accessible {
        title
    } else {
        title.bold().to_string()
    };
    if !report.is_complete() {
        text.push_str(" (incomplete)");
    }
    text.push('\n');

    match report.host_up {
        Some(true) => text.push_str("  host is up\n"),
        Some(false) => text.push_str("  host did not answer ping\n"),
        None => {}
    }

    if report.open_ports.is_empty() {
        text.push_str("  no open ports\n");
    }
    for finding in &report.open_ports {
        let port = format!("{}/{}", finding.port, finding.protocol);
        let _ = write!(text, "  {port:<10} {:<12}", finding.service);
        if let Some(banner) = &finding.banner {
            let first_line = banner.lines().next().unwrap_or_default();
            let preview = first_line
                .chars()
                .take(BANNER_PREVIEW_CHARS)
                .collect::<String>();
            text.push(' ');
            text.push_str(&preview);
            if first_line.chars().count() > BANNER_PREVIEW_CHARS {
                text.push_str("...");
            }
        }
        text = text.trim_end().to_owned();
        text.push('\n');
    }

    let summary = &report.summary;
    let _ = writeln!(
        text,
        "  {} closed, {} filtered, {} timed out, {} errors",
        summary.closed, summary.filtered, summary.timeout, summary.error
    );
    for error in &report.errors {
        let _ = writeln!(text, "  error: {error}");
    }
    text
}
