use crate::monitor::LaunchSpec;
use crate::sequence::total_sequences;
use crate::target::TargetSettings;
use crate::template::MessageTemplate;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Template list is empty")]
    EmptyTemplates,
    #[error("Max depth must be at least 1")]
    ZeroDepth,
    #[error("Batch width must be at least 1")]
    ZeroBatchWidth,
    #[error("{types} templates at depth {depth} overflow the sequence space")]
    SpaceOverflow { types: usize, depth: u32 },
    #[error("Target command is empty")]
    EmptyCommand,
    #[error("Remote coordinator requires a uri")]
    MissingCoordinatorUri,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_iterations_per_case")]
    pub iterations_per_case: u32,
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default)]
    pub exit_when_drained: bool,
    pub seed: Option<u64>,
}

pub fn default_max_depth() -> u32 {
    3
}
pub fn default_iterations_per_case() -> u32 {
    100
}
fn default_idle_ms() -> u64 {
    1000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            iterations_per_case: default_iterations_per_case(),
            idle_ms: default_idle_ms(),
            exit_when_drained: false,
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HandshakeSettings {
    pub certificate: Option<PathBuf>,
    #[serde(default = "default_protinfo")]
    pub protinfo: String,
    #[serde(default = "default_userinfo")]
    pub userinfo: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_protinfo() -> String {
    r"\prot\3\unique\-1\raw\steam\cdkey\9caba13b1a636eb1d0d822aa8c82fd3b".to_string()
}

fn default_userinfo() -> String {
    concat!(
        r"\_cl_autowepswitch\1\bottomcolor\6\cl_dlmax\512\cl_lc\1\cl_lw\1\cl_updaterate\60",
        r"\model\gordon\name\fuzzbot\topcolor\30\_vgui_menus\1\_ah\1\rate\30000"
    )
    .to_string()
}

fn default_max_attempts() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            certificate: None,
            protinfo: default_protinfo(),
            userinfo: default_userinfo(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_remote_address")]
    pub remote_address: SocketAddr,
    #[serde(default = "default_local_address")]
    pub local_address: SocketAddr,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    pub recv_timeout_ms: Option<u64>,
    #[serde(default)]
    pub inherit_output: bool,
    #[serde(default)]
    pub handshake: Option<HandshakeSettings>,
}

fn default_remote_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 27015))
}

fn default_local_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_startup_delay_ms() -> u64 {
    5000
}

/// Applied when a handshake is configured without an explicit receive timeout.
pub const DEFAULT_HANDSHAKE_RECV_TIMEOUT_MS: u64 = 2000;

impl TargetConfig {
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            command: self.command.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            inherit_output: self.inherit_output,
        }
    }

    pub fn settings(&self) -> TargetSettings {
        TargetSettings {
            launch: self.launch_spec(),
            local_address: self.local_address,
            remote_address: self.remote_address,
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            recv_timeout: self
                .recv_timeout_ms
                .or_else(|| self.handshake.as_ref().map(|_| DEFAULT_HANDSHAKE_RECV_TIMEOUT_MS))
                .map(Duration::from_millis),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinatorKind {
    #[default]
    Local,
    Remote,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub kind: CoordinatorKind,
    pub uri: Option<String>,
    #[serde(default = "default_batch_width")]
    pub batch_width: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    pub crash_dir: Option<PathBuf>,
}

fn default_batch_width() -> u64 {
    3
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            kind: CoordinatorKind::Local,
            uri: None,
            batch_width: default_batch_width(),
            request_timeout_ms: default_request_timeout_ms(),
            crash_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RicochetConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    pub target: TargetConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Message alphabet; a built-in set is used when absent.
    pub templates: Option<Vec<MessageTemplate>>,
    /// JSON opcode catalog; a built-in catalog is used when absent.
    pub schema: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RicochetConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: RicochetConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the settings against the alphabet in use and returns the size of the
    /// sequence space.
    pub fn validate(&self, template_count: usize) -> Result<u64, ConfigError> {
        if template_count == 0 {
            return Err(ConfigError::EmptyTemplates);
        }
        if self.fuzzer.max_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.coordinator.batch_width == 0 {
            return Err(ConfigError::ZeroBatchWidth);
        }
        if self.target.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.coordinator.kind == CoordinatorKind::Remote && self.coordinator.uri.is_none() {
            return Err(ConfigError::MissingCoordinatorUri);
        }
        total_sequences(template_count, self.fuzzer.max_depth).ok_or(ConfigError::SpaceOverflow {
            types: template_count,
            depth: self.fuzzer.max_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [target]
        command = ["./hlds_linux", "-game", "cstrike"]
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RicochetConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.fuzzer.max_depth, 3);
        assert_eq!(config.fuzzer.iterations_per_case, 100);
        assert_eq!(config.coordinator.kind, CoordinatorKind::Local);
        assert_eq!(config.coordinator.batch_width, 3);
        assert_eq!(config.target.remote_address, "127.0.0.1:27015".parse().unwrap());
        assert_eq!(config.target.startup_delay_ms, 5000);
        assert!(config.target.handshake.is_none());
        assert!(config.templates.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.validate(4), Ok(64));
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            schema = "catalog.json"

            [fuzzer]
            max-depth = 2
            iterations-per-case = 10
            exit-when-drained = true
            seed = 7

            [target]
            command = ["./server"]
            env = { LD_LIBRARY_PATH = "." }
            remote-address = "127.0.0.1:31337"
            startup-delay-ms = 0
            recv-timeout-ms = 500

            [target.handshake]
            certificate = "steam.cert"
            max-attempts = 5

            [coordinator]
            kind = "remote"
            uri = "http://master:5000"
            batch-width = 1

            [[templates]]
            name = "nop"
            opcode = 1

            [[templates]]
            name = "stringcmd"
            opcode = 3
            fields = [{ kind = "cstring" }]
        "#;
        let config: RicochetConfig = toml::from_str(text).unwrap();
        assert_eq!(config.fuzzer.seed, Some(7));
        assert_eq!(config.target.env["LD_LIBRARY_PATH"], ".");
        let settings = config.target.settings();
        assert_eq!(settings.recv_timeout, Some(Duration::from_millis(500)));
        assert!(settings.startup_delay.is_zero());
        let handshake = config.target.handshake.as_ref().unwrap();
        assert_eq!(handshake.max_attempts, 5);
        assert_eq!(handshake.protinfo, default_protinfo());
        assert_eq!(config.coordinator.kind, CoordinatorKind::Remote);
        assert_eq!(config.templates.as_ref().unwrap().len(), 2);
        assert_eq!(config.schema, Some(PathBuf::from("catalog.json")));
        assert_eq!(config.validate(2), Ok(4));
    }

    #[test]
    fn handshake_without_timeout_gets_default_recv_timeout() {
        let config: RicochetConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.target.settings().recv_timeout, None);

        let text = format!("{MINIMAL}\n[target.handshake]\n");
        let config: RicochetConfig = toml::from_str(&text).unwrap();
        assert_eq!(
            config.target.settings().recv_timeout,
            Some(Duration::from_millis(DEFAULT_HANDSHAKE_RECV_TIMEOUT_MS))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = format!("{MINIMAL}\n[fuzzer]\nthreads = 4\n");
        assert!(toml::from_str::<RicochetConfig>(&text).is_err());
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        let mut config: RicochetConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.validate(0), Err(ConfigError::EmptyTemplates));
        assert_eq!(
            config.validate(1 << 30),
            Err(ConfigError::SpaceOverflow {
                types: 1 << 30,
                depth: 3
            })
        );

        config.coordinator.kind = CoordinatorKind::Remote;
        assert_eq!(config.validate(4), Err(ConfigError::MissingCoordinatorUri));

        config.coordinator.batch_width = 0;
        assert_eq!(config.validate(4), Err(ConfigError::ZeroBatchWidth));

        config.fuzzer.max_depth = 0;
        assert_eq!(config.validate(4), Err(ConfigError::ZeroDepth));
    }

    #[test]
    fn load_from_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = RicochetConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.target.command[0], "./hlds_linux");

        let err =
            RicochetConfig::load_from_file(Path::new("/nonexistent/ricochet.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
