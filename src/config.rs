use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Snaps started when the binary comes up
    #[serde(default)]
    pub snaps: Vec<SnapConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    /// How long a snap has to finish executing before its job is killed
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Upper bound for a host request forwarded into a snap
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Sandbox host process. Every job runs inside this one process.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EnvironmentConfig {
    /// Supports ${ENV_VAR} substitution
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the sandbox host
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PermissionsConfig {
    /// Origins allowed to call into snaps; "*" allows any
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Consecutive failed recoveries before the binary gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SnapConfig {
    pub id: String,
    /// Path to the snap bundle (JavaScript source)
    pub path: PathBuf,
    #[serde(default)]
    pub endowments: Vec<String>,
}

fn default_init_timeout_ms() -> u64 {
    60_000
}

fn default_ping_timeout_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_initial_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_init_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ServiceConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl EnvironmentConfig {
    /// Human-readable description of the sandbox host
    pub fn description(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SNAPS_HOST_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[environment]
command = "node"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.environment.command, "node");
        assert!(config.environment.args.is_empty());
        assert_eq!(config.service, ServiceConfig::default());
        assert_eq!(config.service.init_timeout(), Duration::from_secs(60));
        assert_eq!(config.service.ping_timeout(), Duration::from_secs(2));
        assert_eq!(config.permissions.allowed_origins, vec!["*"]);
        assert_eq!(config.recovery, RecoveryConfig::default());
        assert!(config.snaps.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[service]
init_timeout_ms = 5000
ping_timeout_ms = 250
request_timeout_ms = 10000

[environment]
command = "node"
args = ["host/bundle.js", "--pool"]
env = { NODE_OPTIONS = "--max-old-space-size=256" }

[permissions]
allowed_origins = ["https://metamask.io"]

[recovery]
initial_delay_secs = 2
max_delay_secs = 60
max_attempts = 3

[[snaps]]
id = "npm:hello"
path = "snaps/hello.js"
endowments = ["console"]

[[snaps]]
id = "local:dev"
path = "snaps/dev.js"
"#,
        )
        .unwrap();

        assert_eq!(config.service.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.service.ping_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.environment.env.get("NODE_OPTIONS").map(String::as_str),
            Some("--max-old-space-size=256")
        );
        assert_eq!(config.permissions.allowed_origins, vec!["https://metamask.io"]);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.snaps.len(), 2);
        assert_eq!(config.snaps[0].endowments, vec!["console"]);
        assert!(config.snaps[1].endowments.is_empty());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("SNAP_EXECUTOR_TEST_HOST", "/opt/snaps/host.js");
        let config = Config::parse(
            r#"
[environment]
command = "node"
args = ["${SNAP_EXECUTOR_TEST_HOST}"]
"#,
        )
        .unwrap();
        assert_eq!(config.environment.args, vec!["/opt/snaps/host.js"]);
    }

    #[test]
    fn test_missing_environment_is_an_error() {
        assert!(Config::parse("[service]\ninit_timeout_ms = 1\n").is_err());
    }

    #[test]
    fn test_undefined_env_var_is_an_error() {
        let result = Config::parse(
            r#"
[environment]
command = "${SNAP_EXECUTOR_TEST_UNDEFINED_VARIABLE}"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.environment.command, "node");
    }

    #[test]
    fn test_description() {
        let mut env = Config::parse(MINIMAL).unwrap().environment;
        assert_eq!(env.description(), "node");
        env.args = vec!["host.js".into(), "--pool".into()];
        assert_eq!(env.description(), "node host.js --pool");
    }
}
