//! Subscriber configuration.
//!
//! [`SubscriberConfig`] mirrors the inbound settings a host process hands
//! over (flags, env, or a config file via serde). It is validated once, before
//! the first session, into a [`ConnectionMode`].

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::broker::conn::{BrokerError, RedisUrl};

/// Broker URL used when none is configured.
pub const DEFAULT_URL: &str = "redis://localhost:6379/5";
/// Channel subscribed to when none is configured.
pub const DEFAULT_CHANNEL: &str = "__anycable__";
/// Sentinel master name used when none is configured.
pub const DEFAULT_MASTER_NAME: &str = "mymaster";

/// Inbound subscriber settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Connection URL used in direct mode.
    pub url: String,
    /// Discover the master through sentinels instead of dialing `url`.
    pub sentinels_enabled: bool,
    /// Comma-separated `host:port` sentinel addresses.
    pub sentinels: String,
    /// Master name the sentinels monitor.
    pub master_name: String,
    /// Password for master connections in sentinel mode.
    pub password: Option<SecretString>,
    /// Channel to subscribe to.
    pub channel: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            sentinels_enabled: false,
            sentinels: String::new(),
            master_name: DEFAULT_MASTER_NAME.to_string(),
            password: None,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl SubscriberConfig {
    /// Direct-mode configuration for `url` and `channel`.
    pub fn direct(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Sentinel-mode configuration.
    ///
    /// `sentinels` is a comma-separated address list.
    pub fn sentinel(
        sentinels: impl Into<String>,
        master_name: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            sentinels_enabled: true,
            sentinels: sentinels.into(),
            master_name: master_name.into(),
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Sets the master password used in sentinel mode.
    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    /// Sentinel addresses with whitespace trimmed and empty entries removed.
    pub fn sentinel_addrs(&self) -> Vec<String> {
        self.sentinels
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Checks the static configuration and resolves the connection mode.
    pub fn validate(&self) -> Result<ConnectionMode, ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.channel.trim() != self.channel {
            return Err(ConfigError::PaddedChannel(self.channel.clone()));
        }

        if !self.sentinels_enabled {
            let url = RedisUrl::parse(&self.url).map_err(|err| match err {
                BrokerError::InvalidUrl(message) => ConfigError::InvalidUrl(message),
                other => ConfigError::InvalidUrl(other.to_string()),
            })?;
            return Ok(ConnectionMode::Direct(url));
        }

        let addrs = self.sentinel_addrs();
        if addrs.is_empty() {
            return Err(ConfigError::NoSentinels);
        }
        if self.master_name.trim().is_empty() {
            return Err(ConfigError::MissingMasterName);
        }

        Ok(ConnectionMode::Sentinel {
            addrs,
            master_name: self.master_name.trim().to_string(),
            password: self.password.clone(),
        })
    }
}

/// How sessions reach the broker.
#[derive(Clone, Debug)]
pub enum ConnectionMode {
    /// Dial the configured URL.
    Direct(RedisUrl),
    /// Ask sentinels for the current master and dial it.
    Sentinel {
        addrs: Vec<String>,
        master_name: String,
        password: Option<SecretString>,
    },
}

/// Static configuration problems; never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid redis url: {0}")]
    InvalidUrl(String),

    #[error("channel name must not be empty")]
    EmptyChannel,

    #[error("channel name {0:?} has leading or trailing whitespace")]
    PaddedChannel(String),

    #[error("sentinel mode requires at least one sentinel address")]
    NoSentinels,

    #[error("sentinel mode requires a master name")]
    MissingMasterName,
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{ConfigError, ConnectionMode, SubscriberConfig, DEFAULT_CHANNEL, DEFAULT_URL};

    #[test]
    fn default_config_is_a_valid_direct_setup() {
        let config = SubscriberConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.channel, DEFAULT_CHANNEL);
        match config.validate().expect("valid") {
            ConnectionMode::Direct(url) => {
                assert_eq!(url.addr(), "localhost:6379");
                assert_eq!(url.database(), 5);
            }
            other => panic!("expected direct mode, got {other:?}"),
        }
    }

    #[test]
    fn malformed_url_is_rejected() {
        let config = SubscriberConfig::direct("not a url \u{0}", "updates");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn sentinel_list_is_split_and_trimmed() {
        let config = SubscriberConfig::sentinel(
            " 10.0.0.1:26379, ,10.0.0.2:26379 ,",
            "mymaster",
            "updates",
        )
        .with_password(SecretString::new("pw".to_string()));

        assert_eq!(
            config.sentinel_addrs(),
            vec!["10.0.0.1:26379".to_string(), "10.0.0.2:26379".to_string()]
        );
        match config.validate().expect("valid") {
            ConnectionMode::Sentinel {
                addrs,
                master_name,
                password,
            } => {
                assert_eq!(addrs.len(), 2);
                assert_eq!(master_name, "mymaster");
                assert_eq!(
                    password.as_ref().map(|p| p.expose_secret().as_str()),
                    Some("pw")
                );
            }
            other => panic!("expected sentinel mode, got {other:?}"),
        }
    }

    #[test]
    fn sentinel_mode_ignores_the_direct_url() {
        let mut config = SubscriberConfig::sentinel("10.0.0.1:26379", "mymaster", "updates");
        config.url = "not a url \u{0}".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn incomplete_configurations_are_rejected() {
        assert_eq!(
            SubscriberConfig::sentinel(" , ", "mymaster", "updates")
                .validate()
                .err(),
            Some(ConfigError::NoSentinels)
        );
        assert_eq!(
            SubscriberConfig::sentinel("10.0.0.1:26379", " ", "updates")
                .validate()
                .err(),
            Some(ConfigError::MissingMasterName)
        );
        assert_eq!(
            SubscriberConfig::direct(DEFAULT_URL, "").validate().err(),
            Some(ConfigError::EmptyChannel)
        );
    }

    #[test]
    fn channel_names_are_used_verbatim() {
        assert_eq!(
            SubscriberConfig::direct(DEFAULT_URL, " updates ").validate().err(),
            Some(ConfigError::PaddedChannel(" updates ".to_string()))
        );
        assert_eq!(
            SubscriberConfig::direct(DEFAULT_URL, "  ").validate().err(),
            Some(ConfigError::EmptyChannel)
        );
        assert!(SubscriberConfig::direct(DEFAULT_URL, "room updates")
            .validate()
            .is_ok());
    }

    #[test]
    fn deserializes_with_defaults_and_redacts_password() {
        let config: SubscriberConfig = serde_json::from_str(
            r#"{
                "sentinels_enabled": true,
                "sentinels": "s1:26379,s2:26379",
                "password": "top-secret",
                "channel": "events"
            }"#,
        )
        .expect("config json");

        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.master_name, "mymaster");
        assert_eq!(config.sentinel_addrs().len(), 2);
        assert!(!format!("{config:?}").contains("top-secret"));
    }
}
