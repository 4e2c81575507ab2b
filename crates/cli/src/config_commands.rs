use {
    anyhow::{Result, bail},
    clap::Subcommand,
    feedlink_config::{FeedlinkConfig, Severity, ValidationResult},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check,
    /// Write a default configuration file if none exists.
    Init,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check => check(),
        ConfigAction::Init => init(),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check() -> Result<()> {
    let path = feedlink_config::find_or_default_config_path();
    if path.exists() {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let result = feedlink_config::validate(&feedlink_config::discover_and_load());
    for line in render(&result) {
        eprintln!("{line}");
    }

    let errors = result.count(Severity::Error);
    if errors > 0 {
        bail!("configuration has {errors} error(s)");
    }
    Ok(())
}

fn render(result: &ValidationResult) -> Vec<String> {
    let mut lines: Vec<String> = result
        .diagnostics
        .iter()
        .map(|d| {
            let color = match d.severity {
                Severity::Error => RED,
                Severity::Warning => YELLOW,
            };
            if d.path.is_empty() {
                format!("  {BOLD}{color}{}{RESET} {}", d.severity, d.message)
            } else {
                format!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message)
            }
        })
        .collect();

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if !lines.is_empty() {
        lines.push(String::new());
    }
    if errors == 0 && warnings == 0 {
        lines.push("No issues found.".into());
    } else {
        lines.push(format!("{errors} error(s), {warnings} warning(s)"));
    }
    lines
}

fn init() -> Result<()> {
    let path = feedlink_config::find_or_default_config_path();
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    let written = feedlink_config::save_config(&FeedlinkConfig::default())?;
    println!("Wrote default config to {}", written.display());
    Ok(())
}
