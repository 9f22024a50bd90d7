//! Typed configuration, loaded once at startup from a YAML file.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path:?} as YAML: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub roi: RoiConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate the config file at `path`. Any failure here is
    /// fatal at startup: the process must not open a socket with a
    /// half-trusted configuration.
    pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoiConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "iso8601_duration_serde")]
    pub reconnect_interval: Duration,
    pub templates: RoiTemplates,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoiTemplates {
    pub own_root_start_tag: TemplateConfig,
    pub own_root_end_tag: TemplateConfig,
    pub subscribe: TemplateConfig,
    pub resume_subscription: TemplateConfig,
    pub last_processed: TemplateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub filename: String,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Tls,
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(value: Qos) -> Self {
        match value {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub qos: Qos,
    pub client_id: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default)]
    pub ca_certs_path: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(with = "iso8601_duration_serde")]
    pub retained_message_wait_duration: Duration,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

mod iso8601_duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        crate::asyncutil::parse_iso8601_duration(&raw).map_err(serde::de::Error::custom)
    }
}
