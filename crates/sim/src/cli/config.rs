//! `flowmesh-sim config`: check or dump the resolved configuration.

use anyhow::Context;

use fm_domain::config::{Config, ConfigError, ConfigSeverity};

/// Validation issues of one config file, split by severity.
#[derive(Debug)]
pub struct ConfigReport {
    pub path: String,
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<ConfigError>,
}

impl ConfigReport {
    pub fn check(config: &Config, path: &str) -> Self {
        let (errors, warnings) = config
            .validate()
            .into_iter()
            .partition(|issue| issue.severity == ConfigSeverity::Error);
        Self {
            path: path.to_owned(),
            errors,
            warnings,
        }
    }

    /// Warnings alone do not stop the simulator from starting.
    pub fn is_usable(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors first, then warnings, then a one-line verdict.
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .errors
            .iter()
            .chain(&self.warnings)
            .map(|issue| format!("  {issue}"))
            .collect();
        let verdict = match (self.errors.len(), self.warnings.len()) {
            (0, 0) => "valid".to_owned(),
            (0, w) => format!("usable with {w} warning(s)"),
            (e, w) => format!("rejected: {e} error(s), {w} warning(s)"),
        };
        lines.push(format!("flowmesh config {}: {verdict}", self.path));
        lines
    }
}

/// Print the report for `config`.  Returns `false` when it has errors.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let report = ConfigReport::check(config, config_path);
    for line in report.lines() {
        println!("{line}");
    }
    report.is_usable()
}

/// Print the config as TOML with every default filled in.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config).context("rendering config as TOML")?;
    print!("{rendered}");
    Ok(())
}
