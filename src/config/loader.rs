//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate:
//!
//! 1. Built-in defaults ([`RelayConfig::default`])
//! 2. Optional TOML file (explicit path, or `SCAN_RELAY_CONFIG_PATH`)
//! 3. Environment variables `SCAN_RELAY__<SECTION>__<KEY>`
//! 4. `RABBITMQ_URL` as a shorthand for `rabbitmq.url` when the namespaced
//!    variable is absent
//!
//! The merged result is validated before it is returned.

use super::error::{ConfigResult, ConfigurationError};
use super::RelayConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix for namespaced environment overrides
pub const ENV_PREFIX: &str = "SCAN_RELAY";

/// Separator between prefix, section and key
pub const ENV_SEPARATOR: &str = "__";

/// Environment variable naming the TOML file
pub const CONFIG_PATH_ENV: &str = "SCAN_RELAY_CONFIG_PATH";

/// Environment variable selecting the deployment environment
pub const ENVIRONMENT_ENV: &str = "SCAN_RELAY_ENV";

/// Stateless configuration loader
#[derive(Debug)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Detect environment from `SCAN_RELAY_ENV` or default to "development"
    pub fn detect_environment() -> String {
        std::env::var(ENVIRONMENT_ENV).unwrap_or_else(|_| "development".to_string())
    }

    /// Load configuration from the process environment
    ///
    /// `path` takes precedence over `SCAN_RELAY_CONFIG_PATH`.
    pub fn load(path: Option<&Path>) -> ConfigResult<RelayConfig> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));

        let config = Self::load_from_sources(path.as_deref(), None)?;

        info!(
            environment = %Self::detect_environment(),
            config_file = ?path,
            broker = %config.rabbitmq.connection_url_redacted(),
            queue = %config.rabbitmq.queue,
            workers = config.dispatcher.workers,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load configuration from an optional file and an explicit variable map
    ///
    /// When `env` is `None` the process environment is used. Passing a map keeps
    /// tests independent of the global environment.
    pub fn load_from_sources(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> ConfigResult<RelayConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&RelayConfig::default())?);

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigurationError::file_not_found(path));
            }
            debug!("Reading configuration file: {}", path.display());
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let rabbitmq_url_shorthand = Self::rabbitmq_url_shorthand(env.as_ref());

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("mutation.args")
                .with_list_parse_key("mutation.permanent_exit_codes")
                .source(env),
        );

        if let Some(url) = rabbitmq_url_shorthand {
            builder = builder.set_override("rabbitmq.url", url)?;
        }

        let config: RelayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            "Effective configuration: {}",
            serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        Ok(config)
    }

    /// `RABBITMQ_URL`, unless the namespaced override is also present
    fn rabbitmq_url_shorthand(env: Option<&HashMap<String, String>>) -> Option<String> {
        let namespaced = format!("{ENV_PREFIX}{ENV_SEPARATOR}RABBITMQ{ENV_SEPARATOR}URL");
        match env {
            Some(map) => {
                if map.contains_key(&namespaced) {
                    None
                } else {
                    map.get("RABBITMQ_URL").cloned()
                }
            }
            None => {
                if std::env::var(&namespaced).is_ok() {
                    None
                } else {
                    std::env::var("RABBITMQ_URL").ok()
                }
            }
        }
    }

    /// JSON view of the configuration with credentials masked
    pub fn sanitize_config_for_logging(config: &RelayConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "token", "credential"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        *val = serde_json::Value::String("[MASKED]".to_string());
                    } else if let serde_json::Value::String(s) = val {
                        if s.contains("://") {
                            *s = super::redact_url_credentials(s);
                        }
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}
