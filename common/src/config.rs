// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The `lsd_config` configuration document.
//!
//! The document is JSON with a single top-level key. All options carry
//! defaults; the `services` array is validated after deserialization and
//! duplicate or incomplete service entries are fatal.

use std::{collections::BTreeMap, net::Ipv4Addr, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::identifiers::{NameError, ServiceName};

pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SOCKET_POLL_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_CACHE_LIMIT_MIB: u64 = 512;
pub const DEFAULT_CONTROL_PORT: u16 = 5555;
pub const DEFAULT_MULTICAST_IP: Ipv4Addr = Ipv4Addr::new(226, 1, 1, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 5556;
pub const DEFAULT_STATISTICS_PORT: u16 = 3333;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("service entry {index}: {field} is required")]
    MissingServiceField { index: usize, field: &'static str },
    #[error("service {name}: control_port must be non-zero")]
    ZeroControlPort { name: String },
    #[error("duplicate service name {0}")]
    DuplicateServiceName(String),
    #[error(
        "services {first} and {second} share app_name {app_name} and control_port {port}"
    )]
    DuplicateServiceEndpoint {
        first: String,
        second: String,
        app_name: String,
        port: u16,
    },
    #[error("invalid multicast ip {0}")]
    InvalidMulticastIp(String),
    #[error(transparent)]
    Name(#[from] NameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LoggerType {
    #[serde(rename = "STDOUT")]
    Stdout,
    #[serde(rename = "FILE")]
    File,
    #[serde(rename = "SYSLOG")]
    Syslog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CacheType {
    #[serde(rename = "RAM_ONLY")]
    RamOnly,
    // old configurations ship the misspelled variant
    #[serde(rename = "PERSISTENT", alias = "PERSISTANT")]
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AutodiscoveryType {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "MULTICAST")]
    Multicast,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    #[serde(rename = "type")]
    pub logger_type: LoggerType,
    /// Pipe-separated level flags, e.g. `LOG_INFO|LOG_DEBUG`.
    pub flags: String,
    pub file: String,
    pub syslog_name: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            logger_type: LoggerType::Stdout,
            flags: String::new(),
            file: String::new(),
            syslog_name: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Global capacity bound in bytes, converted from MiB at load.
    pub max_ram_limit_bytes: u64,
    pub cache_type: CacheType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistentStorageConfig {
    pub eblob_path: String,
    pub eblob_log_path: String,
    pub eblob_log_flags: u32,
    pub eblob_sync_interval: u32,
}

impl Default for PersistentStorageConfig {
    fn default() -> Self {
        Self {
            eblob_path: "/tmp/courier_eblob".into(),
            eblob_log_path: "/var/log/courier_eblob.log".into(),
            eblob_log_flags: 0,
            eblob_sync_interval: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutodiscoveryConfig {
    pub discovery_type: AutodiscoveryType,
    pub multicast_ip: Ipv4Addr,
    pub multicast_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub remote_access: bool,
    pub remote_port: u16,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote_access: false,
            remote_port: DEFAULT_STATISTICS_PORT,
        }
    }
}

/// One configured service, validated.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: ServiceName,
    pub description: String,
    pub app_name: String,
    pub instance: String,
    pub hosts_url: String,
    pub control_port: u16,
}

/// The validated configuration of a dispatch client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub config_version: u32,
    pub message_timeout: Duration,
    pub socket_poll_timeout: Duration,
    pub logger: LoggerConfig,
    pub message_cache: CacheConfig,
    pub persistent_storage: PersistentStorageConfig,
    pub autodiscovery: AutodiscoveryConfig,
    pub statistics: StatisticsConfig,
    pub services: BTreeMap<ServiceName, ServiceConfig>,
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let document: Document = serde_json::from_str(data)?;
        document.lsd_config.validate()
    }

    pub fn service(&self, name: &ServiceName) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}

#[derive(Deserialize)]
struct Document {
    lsd_config: RawConfig,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    config_version: u32,
    message_timeout: Option<u64>,
    socket_poll_timeout: Option<u64>,
    logger: LoggerConfig,
    message_cache: RawCacheConfig,
    persistent_storage: PersistentStorageConfig,
    autodiscovery: RawAutodiscoveryConfig,
    statistics: StatisticsConfig,
    services: Vec<RawServiceConfig>,
}

#[derive(Deserialize)]
#[serde(default)]
struct RawCacheConfig {
    max_ram_limit: u64,
    #[serde(rename = "type")]
    cache_type: CacheType,
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            max_ram_limit: DEFAULT_CACHE_LIMIT_MIB,
            cache_type: CacheType::RamOnly,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct RawAutodiscoveryConfig {
    #[serde(rename = "type")]
    discovery_type: AutodiscoveryType,
    multicast_ip: String,
    multicast_port: u16,
}

impl Default for RawAutodiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_type: AutodiscoveryType::Http,
            multicast_ip: DEFAULT_MULTICAST_IP.to_string(),
            multicast_port: DEFAULT_MULTICAST_PORT,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawServiceConfig {
    name: String,
    description: String,
    app_name: String,
    instance: String,
    hosts_url: String,
    control_port: Option<u16>,
}

impl RawConfig {
    fn validate(self) -> Result<ClientConfig, ConfigError> {
        let multicast_ip = self
            .autodiscovery
            .multicast_ip
            .parse()
            .map_err(|_| ConfigError::InvalidMulticastIp(self.autodiscovery.multicast_ip.clone()))?;

        let mut services: BTreeMap<ServiceName, ServiceConfig> = BTreeMap::new();
        for (index, raw) in self.services.into_iter().enumerate() {
            let service = raw.validate(index)?;
            for existing in services.values() {
                if existing.app_name == service.app_name
                    && existing.control_port == service.control_port
                {
                    return Err(ConfigError::DuplicateServiceEndpoint {
                        first: existing.name.to_string(),
                        second: service.name.to_string(),
                        app_name: service.app_name,
                        port: service.control_port,
                    });
                }
            }
            if let Some(previous) = services.insert(service.name.clone(), service) {
                return Err(ConfigError::DuplicateServiceName(previous.name.to_string()));
            }
        }

        Ok(ClientConfig {
            config_version: self.config_version,
            message_timeout: self
                .message_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MESSAGE_TIMEOUT),
            socket_poll_timeout: self
                .socket_poll_timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SOCKET_POLL_TIMEOUT),
            logger: self.logger,
            message_cache: CacheConfig {
                max_ram_limit_bytes: self.message_cache.max_ram_limit * 1024 * 1024,
                cache_type: self.message_cache.cache_type,
            },
            persistent_storage: self.persistent_storage,
            autodiscovery: AutodiscoveryConfig {
                discovery_type: self.autodiscovery.discovery_type,
                multicast_ip,
                multicast_port: self.autodiscovery.multicast_port,
            },
            statistics: self.statistics,
            services,
        })
    }
}

impl RawServiceConfig {
    fn validate(self, index: usize) -> Result<ServiceConfig, ConfigError> {
        let missing = |field| ConfigError::MissingServiceField { index, field };
        if self.name.is_empty() {
            return Err(missing("name"));
        }
        if self.app_name.is_empty() {
            return Err(missing("app_name"));
        }
        if self.instance.is_empty() {
            return Err(missing("instance"));
        }
        if self.hosts_url.is_empty() {
            return Err(missing("hosts_url"));
        }
        let control_port = self.control_port.unwrap_or(DEFAULT_CONTROL_PORT);
        if control_port == 0 {
            return Err(ConfigError::ZeroControlPort { name: self.name });
        }
        Ok(ServiceConfig {
            name: ServiceName::new(self.name)?,
            description: self.description,
            app_name: self.app_name,
            instance: self.instance,
            hosts_url: self.hosts_url,
            control_port,
        })
    }
}
