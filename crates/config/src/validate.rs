//! Semantic validation of a loaded [`BundlerConfig`].
//!
//! Parsing already rejects malformed files; this pass catches configurations
//! that parse fine but cannot work (duplicate aliases, missing executables,
//! unparsable URLs).

use std::collections::HashSet;

use crate::schema::{BundlerConfig, TransportKind};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. `project.upstream[2].url`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: String, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path,
            message: message.into(),
        });
    }
}

/// Validate upstream entries and router settings.
#[must_use]
pub fn validate(config: &BundlerConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let mut seen = HashSet::new();

    if config.project.name.trim().is_empty() {
        result.push(Severity::Error, "project.name".into(), "must not be empty");
    }

    for (idx, entry) in config.project.upstreams.iter().enumerate() {
        let path = format!("project.upstream[{idx}]");
        let alias = entry.alias.trim();

        if alias.is_empty() {
            result.push(Severity::Error, format!("{path}.alias"), "must not be empty");
        } else {
            if alias.contains("__") {
                result.push(
                    Severity::Error,
                    format!("{path}.alias"),
                    format!("'{alias}' must not contain the '__' namespace separator"),
                );
            }
            if alias.contains('/') {
                result.push(
                    Severity::Error,
                    format!("{path}.alias"),
                    format!("'{alias}' must not contain '/'"),
                );
            }
            if !seen.insert(alias.to_string()) {
                result.push(
                    Severity::Error,
                    format!("{path}.alias"),
                    format!("duplicate alias '{alias}'"),
                );
            }
        }

        match entry.transport {
            TransportKind::Stdio => {
                if entry.command.trim().is_empty() {
                    result.push(
                        Severity::Error,
                        format!("{path}.command"),
                        "stdio upstream requires a command",
                    );
                }
                if entry.url.is_some() {
                    result.push(
                        Severity::Warning,
                        format!("{path}.url"),
                        "url is ignored for stdio upstreams",
                    );
                }
                if entry.auth {
                    result.push(
                        Severity::Warning,
                        format!("{path}.auth"),
                        "auth only applies to http upstreams",
                    );
                }
            },
            TransportKind::Http => match entry.url.as_deref() {
                None | Some("") => result.push(
                    Severity::Error,
                    format!("{path}.url"),
                    "http upstream requires a url",
                ),
                Some(raw) => {
                    if let Err(e) = url::Url::parse(raw) {
                        result.push(
                            Severity::Error,
                            format!("{path}.url"),
                            format!("invalid url '{raw}': {e}"),
                        );
                    }
                },
            },
        }

        if !entry.enabled {
            if entry.keep_warm {
                result.push(
                    Severity::Warning,
                    format!("{path}.keep_warm"),
                    "keep_warm has no effect on a disabled upstream",
                );
            } else {
                result.push(
                    Severity::Info,
                    format!("{path}.enabled"),
                    format!("upstream '{alias}' is disabled and will not be bundled"),
                );
            }
        }
    }

    for (idx, rule) in config.router.visibility.iter().enumerate() {
        if rule.client.trim().is_empty() {
            result.push(
                Severity::Error,
                format!("router.visibility[{idx}].client"),
                "must not be empty",
            );
        }
        for alias in &rule.hide_aliases {
            if !seen.contains(alias.as_str()) {
                result.push(
                    Severity::Warning,
                    format!("router.visibility[{idx}].hide_aliases"),
                    format!("unknown alias '{alias}'"),
                );
            }
        }
    }

    if !config.project.upstreams.iter().any(|u| u.enabled) {
        result.push(
            Severity::Info,
            "project.upstream".into(),
            "no enabled upstreams; the bundle will only expose its own tools",
        );
    }

    if config.router.large_response_threshold == 0 {
        result.push(
            Severity::Error,
            "router.large_response_threshold".into(),
            "must be greater than zero",
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{UpstreamEntry, VisibilityRule};

    fn stdio(alias: &str) -> UpstreamEntry {
        UpstreamEntry {
            alias: alias.into(),
            command: "echo".into(),
            ..Default::default()
        }
    }

    #[test]
    fn clean_config_has_no_diagnostics() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![stdio("github"), stdio("jira")];
        let res = validate(&cfg);
        assert!(res.diagnostics.is_empty(), "{:?}", res.diagnostics);
    }

    #[test]
    fn duplicate_alias_is_error() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![stdio("a"), stdio("a")];
        let res = validate(&cfg);
        assert!(res.has_errors());
        assert!(res.diagnostics[0].message.contains("duplicate alias"));
    }

    #[test]
    fn separator_in_alias_is_error() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![stdio("my__server")];
        assert!(validate(&cfg).has_errors());
    }

    #[test]
    fn http_without_url_is_error() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![UpstreamEntry {
            alias: "remote".into(),
            transport: TransportKind::Http,
            ..Default::default()
        }];
        let res = validate(&cfg);
        assert_eq!(res.count(Severity::Error), 1);
        assert_eq!(res.diagnostics[0].path, "project.upstream[0].url");
    }

    #[test]
    fn stdio_without_command_is_error() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![UpstreamEntry {
            alias: "local".into(),
            ..Default::default()
        }];
        assert_eq!(validate(&cfg).count(Severity::Error), 1);
    }

    #[test]
    fn unknown_hidden_alias_is_warning() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![stdio("a")];
        cfg.router.visibility = vec![VisibilityRule {
            client: "cursor".into(),
            hide_aliases: vec!["ghost".into()],
        }];
        let res = validate(&cfg);
        assert!(!res.has_errors());
        assert_eq!(res.count(Severity::Warning), 1);
    }

    #[test]
    fn disabled_upstreams_are_reported_as_info() {
        let mut cfg = BundlerConfig::default();
        cfg.project.upstreams = vec![stdio("github"), UpstreamEntry {
            enabled: false,
            ..stdio("jira")
        }];
        let res = validate(&cfg);
        assert!(!res.has_errors());
        assert_eq!(res.count(Severity::Warning), 0);
        assert_eq!(res.count(Severity::Info), 1);
        assert_eq!(res.diagnostics[0].path, "project.upstream[1].enabled");
        assert_eq!(Severity::Info.to_string(), "info");
    }

    #[test]
    fn empty_project_is_info_only() {
        let res = validate(&BundlerConfig::default());
        assert!(!res.has_errors());
        assert_eq!(res.count(Severity::Info), 1);
        assert_eq!(res.diagnostics[0].path, "project.upstream");
    }
}
