mod channel;
mod observability;
mod protocols;
mod sessions;

pub use channel::*;
pub use observability::*;
pub use protocols::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub protocols: ProtocolsConfig,
    /// Code bundles the static sandbox resolver knows how to load.
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Deployments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One deployed code bundle set.  Every deployment shares the protocol
/// table in `[protocols]`; the hashes decide which flows may resolve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    #[serde(default)]
    pub bundle_hashes: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.sessions.initiated_suffix.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "sessions.initiated_suffix".into(),
                message: "suffix must not be empty (session roles depend on it)".into(),
            });
        }

        if self.channel.max_buffered_events == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "channel.max_buffered_events".into(),
                message: "buffer must hold at least one event".into(),
            });
        }

        if self.channel.resend_window_ms > MAX_RESEND_WINDOW_MS {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "channel.resend_window_ms".into(),
                message: format!(
                    "{} ms exceeds the one-day ceiling of {MAX_RESEND_WINDOW_MS} ms",
                    self.channel.resend_window_ms
                ),
            });
        }

        for (i, init) in self.protocols.initiators.iter().enumerate() {
            check_declaration(
                &mut errors,
                &format!("protocols.initiators[{i}]"),
                &init.flow,
                &init.protocol,
                &init.versions,
            );
        }

        let mut seen = HashSet::new();
        for (i, resp) in self.protocols.responders.iter().enumerate() {
            let field = format!("protocols.responders[{i}]");
            check_declaration(&mut errors, &field, &resp.flow, &resp.protocol, &resp.versions);

            if !resp.responder_flow {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("{field}.responder_flow"),
                    message: format!("{} is not a responder flow", resp.flow),
                });
            }

            for v in &resp.versions {
                if !seen.insert((resp.protocol.as_str(), *v)) {
                    errors.push(ConfigError {
                        severity: ConfigSeverity::Error,
                        field: format!("{field}.versions"),
                        message: format!(
                            "protocol {} version {v} already has a responder",
                            resp.protocol
                        ),
                    });
                }
            }
        }

        if self.deployments.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "deployments".into(),
                message: "no deployments configured; every sandbox lookup will fail".into(),
            });
        }

        errors
    }
}

fn check_declaration(
    errors: &mut Vec<ConfigError>,
    field: &str,
    flow: &str,
    protocol: &str,
    versions: &[u32],
) {
    if flow.is_empty() {
        errors.push(ConfigError {
            severity: ConfigSeverity::Error,
            field: format!("{field}.flow"),
            message: "flow id must not be empty".into(),
        });
    }
    if protocol.is_empty() {
        errors.push(ConfigError {
            severity: ConfigSeverity::Error,
            field: format!("{field}.protocol"),
            message: "protocol name must not be empty".into(),
        });
    }
    if versions.is_empty() {
        errors.push(ConfigError {
            severity: ConfigSeverity::Error,
            field: format!("{field}.versions"),
            message: "at least one version must be declared".into(),
        });
    }
    if versions.contains(&0) {
        errors.push(ConfigError {
            severity: ConfigSeverity::Error,
            field: format!("{field}.versions"),
            message: "versions start at 1".into(),
        });
    }
}
