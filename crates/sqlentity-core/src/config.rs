//! Connection configuration.

use std::collections::HashMap;
use std::time::Duration;

/// Parameters for opening a logical connection.
///
/// The target string is driver-specific (host:port/database for network
/// backends, a label for the in-process store, a service address for a
/// remote session). Credentials travel with the config so a handle can
/// be cloned for a second session against the same account.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Driver-specific target
    pub target: String,
    /// Username for authentication
    pub user: String,
    /// Password for authentication (optional for trust auth)
    pub password: Option<String>,
    /// Application name (visible in server-side session lists)
    pub application_name: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Id-source descriptor, resolved through the factory registry
    pub id_source: Option<String>,
    /// Additional driver parameters
    pub options: HashMap<String, String>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            user: String::new(),
            password: None,
            application_name: None,
            connect_timeout: Duration::from_secs(30),
            id_source: None,
            options: HashMap::new(),
        }
    }
}

impl ConnectConfig {
    /// Create a configuration for the given target and user.
    pub fn new(target: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the id-source descriptor (e.g. `"table:identity:50"`).
    pub fn id_source(mut self, descriptor: impl Into<String>) -> Self {
        self.id_source = Some(descriptor.into());
        self
    }

    /// Set an additional driver option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ConnectConfig::new("db.example.com:5432/app", "operator")
            .password("secret")
            .application_name("billing")
            .connect_timeout(Duration::from_secs(10))
            .id_source("table:identity:50")
            .option("timezone", "UTC");

        assert_eq!(config.target, "db.example.com:5432/app");
        assert_eq!(config.user, "operator");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.application_name, Some("billing".to_string()));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.id_source, Some("table:identity:50".to_string()));
        assert_eq!(config.options.get("timezone"), Some(&"UTC".to_string()));
    }

    #[test]
    fn test_default_is_empty() {
        let config = ConnectConfig::default();
        assert!(config.target.is_empty());
        assert!(config.password.is_none());
        assert!(config.id_source.is_none());
    }
}
