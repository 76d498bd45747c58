use crate::traits::EngineLimits;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Env var naming an extra YAML file layered above the defaults.
pub const CONFIG_PATH_ENV: &str = "QJS_BRIDGE_CONFIG";
const ENV_PREFIX: &str = "QJS_BRIDGE";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub channel_name: String,
    pub engine: EngineConfig,
    pub dispatcher: DispatcherConfig,
    pub logging: LoggingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_name: "dart_quickjs".to_string(),
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub memory_limit_bytes: u64,
    pub max_stack_size_bytes: u64,
    pub gc_threshold_bytes: u64,
    /// 0 disables the per-call budget.
    pub execution_timeout_ms: u64,
    pub settle_promises: bool,
    pub strict: bool,
    /// Most values a single result may contain once copied out of the engine.
    pub max_value_nodes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_size_bytes: 1024 * 1024,
            gc_threshold_bytes: 0,
            execution_timeout_ms: 0,
            settle_promises: true,
            strict: false,
            max_value_nodes: 1_000_000,
        }
    }
}

impl From<&EngineConfig> for EngineLimits {
    fn from(cfg: &EngineConfig) -> Self {
        EngineLimits {
            memory_limit_bytes: cfg.memory_limit_bytes,
            max_stack_size_bytes: cfg.max_stack_size_bytes,
            gc_threshold_bytes: cfg.gc_threshold_bytes,
            execution_timeout_ms: cfg.execution_timeout_ms,
            settle_promises: cfg.settle_promises,
            strict: cfg.strict,
            max_value_nodes: cfg.max_value_nodes,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Create an engine on demand for operations that carry no handle.
    pub default_engine: bool,
    pub worker_stack_size_bytes: u64,
    pub max_payload_bytes: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_engine: true,
            worker_stack_size_bytes: 4 * 1024 * 1024,
            max_payload_bytes: crate::codec::DEFAULT_PAYLOAD_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    pub show_target: bool,
    pub show_file: bool,
    pub show_line: bool,
}

impl Default for LoggingFormatConfig {
    fn default() -> Self {
        Self {
            show_time: true,
            show_target: true,
            show_file: false,
            show_line: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingLevelsConfig {
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
    pub critical: bool,
}

impl Default for LoggingLevelsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            info: true,
            warning: true,
            error: true,
            critical: true,
        }
    }
}

impl LoggingLevelsConfig {
    /// The most verbose enabled level as an `EnvFilter` directive.
    pub fn directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.info {
            "info"
        } else if self.warning {
            "warn"
        } else if self.error || self.critical {
            "error"
        } else {
            "off"
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub patterns: Vec<RedactionPattern>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

static CONFIG: RwLock<Option<&'static BridgeConfig>> = RwLock::new(None);

/// Process-wide configuration, loaded once. A broken config source falls
/// back to defaults rather than taking the host down.
pub fn get_config() -> &'static BridgeConfig {
    if let Some(cfg) = *CONFIG.read().unwrap_or_else(PoisonError::into_inner) {
        return cfg;
    }

    let mut write = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(cfg) = *write {
        return cfg;
    }

    let cfg: &'static BridgeConfig = Box::leak(Box::new(load_config().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load bridge config, using defaults");
        BridgeConfig::default()
    })));
    *write = Some(cfg);
    cfg
}

#[cfg(test)]
pub fn reset_config() {
    let mut write = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    *write = None;
}

fn locate(name: &str) -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let in_manifest = Path::new(&manifest_dir).join(name);
    if in_manifest.exists() {
        return in_manifest;
    }
    let in_cwd = PathBuf::from(name);
    if in_cwd.exists() {
        return in_cwd;
    }
    // Repo-root execution.
    Path::new("crates").join("bridge").join(name)
}

pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::from(locate("bridge_config.yaml")).required(false))
        .add_source(File::from(locate(".bridge_config.yaml")).required(false));

    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        builder = builder.add_source(File::from(PathBuf::from(explicit)).required(true));
    }

    // Nested keys: QJS_BRIDGE__ENGINE__MEMORY_LIMIT_BYTES=1048576
    builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard(&'static str);
    impl EnvGuard {
        fn new(key: &'static str, val: &str) -> Self {
            reset_config();
            env::set_var(key, val);
            Self(key)
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.0);
            reset_config();
        }
    }

    #[test]
    #[serial]
    fn test_load_config() {
        let config = load_config();
        assert!(config.is_ok(), "Failed to load config: {:?}", config.err());

        let config = config.unwrap();
        assert_eq!(config.channel_name, "dart_quickjs");
        assert_eq!(config.engine.memory_limit_bytes, 64 * 1024 * 1024);
        assert!(config.dispatcher.default_engine);
    }

    #[test]
    #[serial]
    fn test_env_var_override_precedence() {
        let _guard = EnvGuard::new("QJS_BRIDGE__CHANNEL_NAME", "custom_channel");

        let config = load_config().expect("Should load config");
        assert_eq!(config.channel_name, "custom_channel");
    }

    #[test]
    #[serial]
    fn test_type_coercion_numeric() {
        let _guard1 = EnvGuard::new("QJS_BRIDGE__ENGINE__MEMORY_LIMIT_BYTES", "1048576");
        let _guard2 = EnvGuard::new("QJS_BRIDGE__ENGINE__EXECUTION_TIMEOUT_MS", "250");
        let _guard3 = EnvGuard::new("QJS_BRIDGE__ENGINE__MAX_VALUE_NODES", "5000");

        let config = load_config().expect("Should load config");
        assert_eq!(config.engine.memory_limit_bytes, 1048576);
        assert_eq!(config.engine.execution_timeout_ms, 250);
        let limits = EngineLimits::from(&config.engine);
        assert_eq!(limits.execution_timeout_ms, 250);
        assert_eq!(limits.max_value_nodes, 5000);
    }

    #[test]
    #[serial]
    fn test_type_coercion_boolean() {
        {
            let _guard = EnvGuard::new("QJS_BRIDGE__DISPATCHER__DEFAULT_ENGINE", "false");
            let config = load_config().expect("Should load config");
            assert!(!config.dispatcher.default_engine);
        }

        {
            let _guard = EnvGuard::new("QJS_BRIDGE__ENGINE__STRICT", "1");
            let config = load_config().expect("Should load config");
            assert!(config.engine.strict);
        }
    }

    #[test]
    #[serial]
    fn test_explicit_config_file() {
        let path = env::temp_dir().join(format!("qjs_bridge_{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "engine:\n  execution_timeout_ms: 75\nlogging:\n  levels:\n    debug: true\n",
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();
        {
            let _guard = EnvGuard::new(CONFIG_PATH_ENV, &path_str);
            let config = load_config().expect("Should load config");
            assert_eq!(config.engine.execution_timeout_ms, 75);
            assert_eq!(config.logging.levels.directive(), "debug");
            // Untouched fields keep their defaults.
            assert!(config.engine.settle_promises);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let _guard = EnvGuard::new(CONFIG_PATH_ENV, "/nonexistent/qjs_bridge.yaml");
        assert!(load_config().is_err());
        assert_eq!(get_config().channel_name, "dart_quickjs");
    }

    #[test]
    fn test_level_directive() {
        let mut levels = LoggingLevelsConfig::default();
        assert_eq!(levels.directive(), "info");
        levels.info = false;
        assert_eq!(levels.directive(), "warn");
        levels.warning = false;
        levels.error = false;
        levels.critical = false;
        assert_eq!(levels.directive(), "off");
    }
}
