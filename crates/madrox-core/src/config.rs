//! Environment-driven orchestrator configuration.
//!
//! All knobs come from the environment; there is no config file. Invalid
//! values are a [`ConfigError`], which the binary maps to exit code 2.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;

/// Default TCP port for the HTTP transport.
const DEFAULT_PORT: u16 = 8765;
/// Default cap on concurrently managed instances.
const DEFAULT_MAX_INSTANCES: usize = 20;
/// Default paste-buffer threshold in bytes.
const DEFAULT_PASTE_THRESHOLD: usize = 3 * 1024;

/// Configuration error. Maps to process exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid glob pattern in {var}: {source}")]
    Pattern {
        var: &'static str,
        #[source]
        source: globset::Error,
    },
}

/// Which transport the orchestrator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Line-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// HTTP endpoint with WebSocket log stream.
    Http,
}

impl TransportMode {
    /// Parse `MADROX_TRANSPORT` / `--transport` values.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Invalid {
                var: "MADROX_TRANSPORT",
                value: other.to_string(),
                reason: "expected 'http' or 'stdio'".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Orchestrator configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for collected team artifacts (`ARTIFACTS_DIR`).
    pub artifacts_dir: PathBuf,
    /// Root directory under which per-instance workspaces are allocated
    /// (`WORKSPACE_DIR`).
    pub workspace_dir: PathBuf,
    /// Cap on concurrently managed instances (`MAX_INSTANCES`).
    pub max_instances: usize,
    /// Transport override (`MADROX_TRANSPORT`); `None` means auto-select.
    pub transport: Option<TransportMode>,
    /// HTTP listen port (`ORCHESTRATOR_PORT`).
    pub port: u16,
    /// Compress captured `output.log` artifacts with zstd
    /// (`ARTIFACTS_COMPRESS`).
    pub artifacts_compress: bool,
    /// Delete artifact directories older than this many days after each
    /// collection (`ARTIFACTS_RETENTION_DAYS`); `None` disables the sweep.
    pub artifacts_retention_days: Option<u32>,
    /// Include globs for workspace mirroring (`ARTIFACTS_PATTERNS`,
    /// comma-separated). Empty set means include everything.
    pub artifacts_include: Vec<String>,
    /// Exclude globs for workspace mirroring (`ARTIFACTS_EXCLUDE_PATTERNS`).
    pub artifacts_exclude: Vec<String>,
    /// Message size at which injection switches to the tmux paste buffer.
    pub paste_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("./artifacts"),
            workspace_dir: PathBuf::from("./workspaces"),
            max_instances: DEFAULT_MAX_INSTANCES,
            transport: None,
            port: DEFAULT_PORT,
            artifacts_compress: false,
            artifacts_retention_days: None,
            artifacts_include: Vec::new(),
            artifacts_exclude: Vec::new(),
            paste_threshold: DEFAULT_PASTE_THRESHOLD,
        }
    }
}

impl Config {
    /// Resolve configuration from the environment.
    ///
    /// Unset variables fall back to defaults; set-but-invalid variables are
    /// an error so misconfiguration fails loudly at startup instead of being
    /// silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(dir) = std::env::var("ARTIFACTS_DIR") {
            if !dir.trim().is_empty() {
                cfg.artifacts_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("WORKSPACE_DIR") {
            if !dir.trim().is_empty() {
                cfg.workspace_dir = PathBuf::from(dir);
            }
        }
        if let Ok(raw) = std::env::var("MAX_INSTANCES") {
            cfg.max_instances = raw.trim().parse::<usize>().ok().filter(|v| *v > 0).ok_or(
                ConfigError::Invalid {
                    var: "MAX_INSTANCES",
                    value: raw.clone(),
                    reason: "expected a positive integer".to_string(),
                },
            )?;
        }
        if let Ok(raw) = std::env::var("MADROX_TRANSPORT") {
            cfg.transport = Some(TransportMode::parse(&raw)?);
        }
        if let Ok(raw) = std::env::var("ORCHESTRATOR_PORT") {
            cfg.port = raw
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or(ConfigError::Invalid {
                    var: "ORCHESTRATOR_PORT",
                    value: raw.clone(),
                    reason: "expected a TCP port number".to_string(),
                })?;
        }
        if let Ok(raw) = std::env::var("ARTIFACTS_COMPRESS") {
            cfg.artifacts_compress = parse_bool(&raw);
        }
        if let Ok(raw) = std::env::var("ARTIFACTS_RETENTION_DAYS") {
            cfg.artifacts_retention_days = Some(
                raw.trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|v| *v > 0)
                    .ok_or(ConfigError::Invalid {
                        var: "ARTIFACTS_RETENTION_DAYS",
                        value: raw.clone(),
                        reason: "expected a positive integer".to_string(),
                    })?,
            );
        }
        if let Ok(raw) = std::env::var("ARTIFACTS_PATTERNS") {
            cfg.artifacts_include = split_patterns(&raw);
        }
        if let Ok(raw) = std::env::var("ARTIFACTS_EXCLUDE_PATTERNS") {
            cfg.artifacts_exclude = split_patterns(&raw);
        }
        if let Ok(raw) = std::env::var("MADROX_PASTE_THRESHOLD") {
            cfg.paste_threshold = raw.trim().parse::<usize>().ok().filter(|v| *v > 0).ok_or(
                ConfigError::Invalid {
                    var: "MADROX_PASTE_THRESHOLD",
                    value: raw.clone(),
                    reason: "expected a positive byte count".to_string(),
                },
            )?;
        }

        // Compile eagerly so a bad glob is a startup error, not a surprise
        // during the first artifact collection.
        cfg.include_set()?;
        cfg.exclude_set()?;

        Ok(cfg)
    }

    /// Compiled include globs. Empty input yields an empty set, which the
    /// collector treats as match-all.
    pub fn include_set(&self) -> Result<GlobSet, ConfigError> {
        build_globset(&self.artifacts_include, "ARTIFACTS_PATTERNS")
    }

    /// Compiled exclude globs.
    pub fn exclude_set(&self) -> Result<GlobSet, ConfigError> {
        build_globset(&self.artifacts_exclude, "ARTIFACTS_EXCLUDE_PATTERNS")
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn build_globset(patterns: &[String], var: &'static str) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|source| ConfigError::Pattern { var, source })?);
    }
    builder
        .build()
        .map_err(|source| ConfigError::Pattern { var, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "ARTIFACTS_DIR",
            "WORKSPACE_DIR",
            "MAX_INSTANCES",
            "MADROX_TRANSPORT",
            "ORCHESTRATOR_PORT",
            "ARTIFACTS_COMPRESS",
            "ARTIFACTS_RETENTION_DAYS",
            "ARTIFACTS_PATTERNS",
            "ARTIFACTS_EXCLUDE_PATTERNS",
            "MADROX_PASTE_THRESHOLD",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_when_env_unset() {
        clear_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.artifacts_dir, PathBuf::from("./artifacts"));
        assert_eq!(cfg.max_instances, DEFAULT_MAX_INSTANCES);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.transport.is_none());
        assert!(!cfg.artifacts_compress);
        assert_eq!(cfg.paste_threshold, 3 * 1024);
    }

    #[test]
    #[serial]
    fn invalid_max_instances_is_an_error() {
        clear_env();
        std::env::set_var("MAX_INSTANCES", "zero");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "MAX_INSTANCES",
                ..
            }
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn transport_override_parses() {
        clear_env();
        std::env::set_var("MADROX_TRANSPORT", "STDIO");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.transport, Some(TransportMode::Stdio));
        std::env::set_var("MADROX_TRANSPORT", "carrier-pigeon");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn patterns_split_and_compile() {
        clear_env();
        std::env::set_var("ARTIFACTS_PATTERNS", "*.rs, src/**,  ");
        std::env::set_var("ARTIFACTS_EXCLUDE_PATTERNS", "target/**,*.lock");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.artifacts_include.len(), 2);
        let include = cfg.include_set().unwrap();
        assert!(include.is_match("main.rs"));
        let exclude = cfg.exclude_set().unwrap();
        assert!(exclude.is_match("Cargo.lock"));
        clear_env();
    }

    #[test]
    #[serial]
    fn bad_glob_fails_at_startup() {
        clear_env();
        std::env::set_var("ARTIFACTS_PATTERNS", "src/[");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nope"));
    }
}
