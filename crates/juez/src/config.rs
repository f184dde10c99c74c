//! Configuration for the juez judge service, loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use juez_common::Limits;

use crate::sandbox::SandboxPolicy;

const MIB: u64 = 1024 * 1024;

/// Judge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (development, staging, production)
    pub environment: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Log output format
    pub log_format: LogFormat,

    /// Where reference harnesses live
    pub registry: RegistryConfig,

    /// Compiler invocation
    pub compiler: CompilerConfig,

    /// Execution limits
    pub execution: ExecutionConfig,

    /// Child process isolation
    pub sandbox: SandboxPolicy,

    /// Attempt workspaces
    pub storage: StorageConfig,

    /// Stale workspace sweeping
    pub janitor: JanitorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Exercise registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base directories searched in order for `guide-N/exercise-M.c`
    pub tests_paths: Vec<PathBuf>,
}

/// Compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Compiler executable
    pub program: String,
    /// Flags placed before the source files
    pub flags: Vec<String>,
    /// Flags placed after the source files
    pub linker_flags: Vec<String>,
    /// Compilation timeout in seconds
    pub timeout_secs: u64,
    /// Cap on compiler diagnostics returned to the learner
    pub diagnostics_limit_bytes: usize,
}

/// Execution limits configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Limits applied when a request does not ask for any
    pub default_limits: Limits,
    /// Upper bound for requested limits
    pub max_limits: Limits,
    /// Largest accepted submission source
    pub max_source_bytes: usize,
    /// Grading attempts allowed to run at once
    pub max_parallel_attempts: usize,
}

/// Storage path configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Parent directory of per-attempt workspaces
    pub workspace_root: PathBuf,
}

/// Janitor configuration
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Cron expression for the stale workspace sweep (default: every 15 min)
    pub schedule: String,
    /// Workspaces older than this are considered abandoned
    pub stale_after_minutes: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if not found)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let default_limits = Limits {
            timeout_ms: vars.positive("DEFAULT_TIMEOUT_MS", 5_000)?,
            max_memory_bytes: vars.mebibytes("DEFAULT_MEMORY_LIMIT_MB", 256)?,
            max_output_bytes: vars.positive("OUTPUT_LIMIT_BYTES", 64 * 1024)?,
        };
        let max_limits = Limits {
            timeout_ms: vars.positive("MAX_TIMEOUT_MS", 30_000)?,
            max_memory_bytes: vars.mebibytes("MAX_MEMORY_LIMIT_MB", 1024)?,
            max_output_bytes: default_limits.max_output_bytes,
        };
        if default_limits.timeout_ms > max_limits.timeout_ms {
            return Err(ConfigError::InvalidValue("DEFAULT_TIMEOUT_MS".to_string()));
        }
        if default_limits.max_memory_bytes > max_limits.max_memory_bytes {
            return Err(ConfigError::InvalidValue("DEFAULT_MEMORY_LIMIT_MB".to_string()));
        }

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let max_parallel_attempts = vars.parse("MAX_PARALLEL_ATTEMPTS", default_parallelism)?;
        if max_parallel_attempts == 0 {
            return Err(ConfigError::InvalidValue("MAX_PARALLEL_ATTEMPTS".to_string()));
        }

        let log_format = match vars.string("LOG_FORMAT", "pretty").as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => return Err(ConfigError::InvalidValue("LOG_FORMAT".to_string())),
        };

        let defaults = SandboxPolicy::default();

        Ok(Self {
            environment: vars.string("ENVIRONMENT", "development"),
            host: vars.string("HOST", "0.0.0.0"),
            port: vars.parse("PORT", 8000)?,
            log_format,
            registry: RegistryConfig {
                tests_paths: vars
                    .list("TESTS_BASE_PATH", ':', "/tests:./tests")
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            },
            compiler: CompilerConfig {
                program: vars.string("COMPILER", "gcc"),
                flags: vars.list("COMPILER_FLAGS", ' ', "-std=c2x -Wall -Wextra"),
                linker_flags: vars.list("LINKER_FLAGS", ' ', "-lm"),
                timeout_secs: vars.parse("COMPILE_TIMEOUT_SECS", 10)?,
                diagnostics_limit_bytes: vars.parse("DIAGNOSTICS_LIMIT_BYTES", 16 * 1024)?,
            },
            execution: ExecutionConfig {
                default_limits,
                max_limits,
                max_source_bytes: vars.parse("MAX_SOURCE_BYTES", 64 * 1024)?,
                max_parallel_attempts,
            },
            sandbox: SandboxPolicy {
                strict: vars.flag("SANDBOX_STRICT", defaults.strict)?,
                isolate_network: vars.flag("SANDBOX_ISOLATE_NETWORK", defaults.isolate_network)?,
                isolate_pids: vars.flag("SANDBOX_ISOLATE_PIDS", defaults.isolate_pids)?,
                readonly_root: vars.flag("SANDBOX_READONLY_ROOT", defaults.readonly_root)?,
                ..defaults
            },
            storage: StorageConfig {
                workspace_root: vars
                    .get("WORKSPACE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| env::temp_dir().join("juez")),
            },
            janitor: JanitorConfig {
                schedule: vars.string("JANITOR_SCHEDULE", "0 */15 * * * *"),
                stale_after_minutes: vars.parse("WORKSPACE_STALE_MINUTES", 30)?,
            },
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string())),
            None => Ok(default),
        }
    }

    /// A `u64` that must be at least 1.
    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.parse(key, default)? {
            0 => Err(ConfigError::InvalidValue(key.to_string())),
            value => Ok(value),
        }
    }

    /// A size given in MiB, returned in bytes.
    fn mebibytes(&self, key: &str, default_mb: u64) -> Result<u64, ConfigError> {
        self.positive(key, default_mb)?
            .checked_mul(MIB)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).as_deref().map(str::trim) {
            Some("1") | Some("true") | Some("yes") => Ok(true),
            Some("0") | Some("false") | Some("no") => Ok(false),
            Some(_) => Err(ConfigError::InvalidValue(key.to_string())),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str, separator: char, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.compiler.program, "gcc");
        assert_eq!(config.compiler.flags, vec!["-std=c2x", "-Wall", "-Wextra"]);
        assert_eq!(config.compiler.linker_flags, vec!["-lm"]);
        assert_eq!(config.compiler.timeout_secs, 10);
        assert_eq!(config.execution.default_limits.timeout_ms, 5_000);
        assert_eq!(config.execution.default_limits.max_memory_bytes, 256 * MIB);
        assert_eq!(
            config.registry.tests_paths,
            vec![PathBuf::from("/tests"), PathBuf::from("./tests")]
        );
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.sandbox.isolate_network);
        assert!(config.sandbox.isolate_pids);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PORT", "9100"),
            ("TESTS_BASE_PATH", "/srv/tests:/opt/tests"),
            ("DEFAULT_TIMEOUT_MS", "1500"),
            ("SANDBOX_STRICT", "true"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.registry.tests_paths.len(), 2);
        assert_eq!(config.execution.default_limits.timeout_ms, 1500);
        assert!(config.sandbox.strict);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            load(&[("PORT", "eighty")]),
            Err(ConfigError::InvalidValue(key)) if key == "PORT"
        ));
        assert!(load(&[("SANDBOX_STRICT", "maybe")]).is_err());
        assert!(load(&[("MAX_PARALLEL_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("DEFAULT_TIMEOUT_MS", "60000")]).is_err());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        for key in [
            "DEFAULT_TIMEOUT_MS",
            "MAX_TIMEOUT_MS",
            "DEFAULT_MEMORY_LIMIT_MB",
            "MAX_MEMORY_LIMIT_MB",
            "OUTPUT_LIMIT_BYTES",
        ] {
            assert!(
                matches!(load(&[(key, "0")]), Err(ConfigError::InvalidValue(k)) if k == key),
                "{key}=0 should be rejected"
            );
        }
    }

    #[test]
    fn test_memory_overflow_is_rejected() {
        let huge = u64::MAX.to_string();
        assert!(matches!(
            load(&[("MAX_MEMORY_LIMIT_MB", huge.as_str())]),
            Err(ConfigError::InvalidValue(key)) if key == "MAX_MEMORY_LIMIT_MB"
        ));
    }
}
