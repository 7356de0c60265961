//! Discovery configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::EtcdConnectOptions;
use crate::discovery::{WatcherOptions, DEFAULT_LEASE_TTL_SECS};
use crate::routing::{TransportOptions, GRPC_PROTOCOL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// etcd endpoints
    pub endpoints: Vec<String>,
    /// Directory prefix every service lives under
    pub prefix: String,
    pub lease_ttl_secs: i64,
    pub watch_reconnect_delay_ms: u64,
    /// Services to route to, relative to `prefix`
    pub follow: Vec<String>,
    /// This instance's announcement, if it serves anything
    pub registration: Option<RegistrationConfig>,
    pub transport: TransportConfig,
    pub connect_max_attempts: usize,
    /// Timeout for unary etcd requests, unbounded when unset
    pub etcd_request_timeout_ms: Option<u64>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/service".to_string(),
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            watch_reconnect_delay_ms: 1000,
            follow: Vec::new(),
            registration: None,
            transport: TransportConfig::default(),
            connect_max_attempts: 5,
            etcd_request_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub service: String,
    pub instance: String,
    /// Address other nodes connect to, e.g. `10.0.0.1:9000`
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub max_retry: u32,
    pub protocol: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            connect_timeout_ms: None,
            max_retry: 3,
            protocol: GRPC_PROTOCOL.to_string(),
        }
    }
}

impl DiscoveryConfig {
    /// Every problem with this configuration; empty if valid
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.endpoints.is_empty() {
            problems.push("discovery.endpoints must not be empty".to_string());
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            problems.push("discovery.endpoints contains an empty endpoint".to_string());
        }
        if !self.prefix.starts_with('/') || self.prefix.ends_with('/') {
            problems.push(format!(
                "discovery.prefix must start with '/' and not end with one, got {:?}",
                self.prefix
            ));
        }
        if self.lease_ttl_secs < 1 {
            problems.push(format!(
                "discovery.lease_ttl_secs must be at least 1, got {}",
                self.lease_ttl_secs
            ));
        }
        if self.connect_max_attempts == 0 {
            problems.push("discovery.connect_max_attempts must be at least 1".to_string());
        }
        for service in &self.follow {
            if !is_segment_path(service) {
                problems.push(format!("discovery.follow has invalid service name {service:?}"));
            }
        }
        if let Some(registration) = &self.registration {
            if !is_segment_path(&registration.service) {
                problems.push(format!(
                    "discovery.registration.service is invalid: {:?}",
                    registration.service
                ));
            }
            if registration.instance.is_empty() || registration.instance.contains('/') {
                problems.push(format!(
                    "discovery.registration.instance must be a single key segment, got {:?}",
                    registration.instance
                ));
            }
            if registration.address.trim().is_empty() {
                problems.push("discovery.registration.address must not be empty".to_string());
            }
        }
        if self.transport.protocol != GRPC_PROTOCOL {
            problems.push(format!(
                "discovery.transport.protocol {:?} is not supported",
                self.transport.protocol
            ));
        }

        problems
    }

    /// Directory name of `service`, e.g. `/service/chat-svc`
    #[must_use]
    pub fn service_key(&self, service: &str) -> String {
        format!("{}/{}", self.prefix, service)
    }

    /// Key of this instance's announcement
    #[must_use]
    pub fn instance_key(&self, registration: &RegistrationConfig) -> String {
        format!("{}/{}", self.service_key(&registration.service), registration.instance)
    }

    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.transport.timeout_ms.map(Duration::from_millis),
            connect_timeout: self.transport.connect_timeout_ms.map(Duration::from_millis),
            max_retry: self.transport.max_retry,
            protocol: self.transport.protocol.clone(),
        }
    }

    #[must_use]
    pub const fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            reconnect_delay: Duration::from_millis(self.watch_reconnect_delay_ms),
        }
    }

    #[must_use]
    pub fn etcd_connect_options(&self) -> EtcdConnectOptions {
        EtcdConnectOptions {
            max_attempts: self.connect_max_attempts,
            request_timeout: self.etcd_request_timeout_ms.map(Duration::from_millis),
            ..EtcdConnectOptions::default()
        }
    }
}

// `chat-svc` or `chat/v2`, never with a leading or trailing slash
fn is_segment_path(name: &str) -> bool {
    !name.is_empty() && name.split('/').all(|segment| !segment.is_empty())
}
