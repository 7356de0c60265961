use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use socialmesh_discovery::{DiscoveryConfig, RegistrationConfig};

/// Process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            } else {
                return Err(ConfigError::Message(format!("config file {path} not found")));
            }
        }

        // SOCIALMESH_DISCOVERY__LEASE_TTL_SECS, SOCIALMESH_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("SOCIALMESH")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("discovery.endpoints")
                .with_list_parse_key("discovery.follow")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Command line values win over file and environment
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if !overrides.follow.is_empty() {
            self.discovery.follow = overrides.follow;
        }

        let registration = match self.discovery.registration.take() {
            Some(mut existing) => {
                if let Some(service) = overrides.service {
                    existing.service = service;
                }
                if let Some(instance) = overrides.instance {
                    existing.instance = instance;
                }
                if let Some(address) = overrides.address {
                    existing.address = address;
                }
                Some(existing)
            }
            None => match (overrides.service, overrides.address) {
                (Some(service), Some(address)) => Some(RegistrationConfig {
                    service,
                    instance: overrides.instance.unwrap_or_else(generate_instance_id),
                    address,
                }),
                _ => None,
            },
        };
        self.discovery.registration = registration;
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub follow: Vec<String>,
    pub service: Option<String>,
    pub instance: Option<String>,
    pub address: Option<String>,
}

/// Instance name for this process: hostname plus a random suffix
#[must_use]
pub fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r"
discovery:
  endpoints: ['http://etcd-0:2379', 'http://etcd-1:2379']
  prefix: /mesh
  follow: [chat-svc, feed-svc]
  registration:
    service: chat-svc
    instance: node1
    address: '10.0.0.1:9000'
logging:
  format: json
",
        );

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.discovery.endpoints.len(), 2);
        assert_eq!(config.discovery.prefix, "/mesh");
        assert_eq!(config.discovery.follow, vec!["chat-svc", "feed-svc"]);
        assert_eq!(
            config.discovery.registration.as_ref().map(|r| r.instance.as_str()),
            Some("node1")
        );
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/socialmesh.yaml")).is_err());
    }

    #[test]
    fn test_overrides_build_registration() {
        let mut config = Config::default();
        config.apply_overrides(Overrides {
            follow: vec!["feed-svc".to_string()],
            service: Some("chat-svc".to_string()),
            instance: None,
            address: Some("10.0.0.1:9000".to_string()),
        });

        assert_eq!(config.discovery.follow, vec!["feed-svc"]);
        let registration = config.discovery.registration.unwrap();
        assert_eq!(registration.service, "chat-svc");
        assert!(!registration.instance.is_empty());
        assert!(!registration.instance.contains('/'));
    }

    #[test]
    fn test_overrides_need_service_and_address() {
        let mut config = Config::default();
        config.apply_overrides(Overrides {
            service: Some("chat-svc".to_string()),
            ..Overrides::default()
        });
        assert!(config.discovery.registration.is_none());
    }

    #[test]
    fn test_overrides_patch_existing_registration() {
        let mut config = Config::default();
        config.discovery.registration = Some(RegistrationConfig {
            service: "chat-svc".to_string(),
            instance: "node1".to_string(),
            address: "10.0.0.1:9000".to_string(),
        });
        config.discovery.follow = vec!["chat-svc".to_string()];

        config.apply_overrides(Overrides {
            address: Some("10.0.0.2:9000".to_string()),
            ..Overrides::default()
        });

        let registration = config.discovery.registration.unwrap();
        assert_eq!(registration.instance, "node1");
        assert_eq!(registration.address, "10.0.0.2:9000");
        assert_eq!(config.discovery.follow, vec!["chat-svc"]);
    }
}
