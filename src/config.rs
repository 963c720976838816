//! Configuration types, built from environment variables.
//!
//! Each config has a `from_lookup` constructor taking a key → value function
//! so tests can supply values without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::model::Medium;
use crate::transport::parse_mailbox;

pub const DEFAULT_MEDIUM_NAME: &str = "email";
pub const DEFAULT_SUBJECT_TRUNCATE_LENGTH: usize = 40;

/// Resolution and dispatch settings passed into the resolver and dispatcher.
#[derive(Debug, Clone)]
pub struct EmailerConfig {
    /// Emailer-specific sender (`ENTITY_EMAILER_FROM_EMAIL`).
    pub default_from_address: Option<String>,
    /// Application-wide sender used when no emailer-specific one is set
    /// (`DEFAULT_FROM_EMAIL`).
    pub system_from_address: Option<String>,
    /// Medium whose subscriptions drive email delivery.
    pub email_medium_name: String,
    /// Longest extracted subject before it is cut and suffixed with `...`.
    pub subject_truncate_length: usize,
}

impl Default for EmailerConfig {
    fn default() -> Self {
        Self {
            default_from_address: None,
            system_from_address: None,
            email_medium_name: DEFAULT_MEDIUM_NAME.to_string(),
            subject_truncate_length: DEFAULT_SUBJECT_TRUNCATE_LENGTH,
        }
    }
}

impl EmailerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            default_from_address: non_empty(lookup("ENTITY_EMAILER_FROM_EMAIL")),
            system_from_address: non_empty(lookup("DEFAULT_FROM_EMAIL")),
            email_medium_name: non_empty(lookup("ENTITY_EMAILER_MEDIUM_NAME"))
                .unwrap_or(defaults.email_medium_name),
            subject_truncate_length: parse_or(
                &lookup,
                "ENTITY_EMAILER_SUBJECT_TRUNCATE",
                defaults.subject_truncate_length,
            )?,
        };
        if let Some(address) = &config.default_from_address {
            validate_sender("ENTITY_EMAILER_FROM_EMAIL", address)?;
        }
        if let Some(address) = &config.system_from_address {
            validate_sender("DEFAULT_FROM_EMAIL", address)?;
        }
        Ok(config)
    }

    pub fn medium(&self) -> Medium {
        Medium(self.email_medium_name.clone())
    }

    /// Pick the sender for one email: override, then emailer default, then system default.
    ///
    /// An unparseable override is ignored in favour of the configured sender;
    /// an unparseable configured sender is a configuration error.
    pub fn resolve_from_address<'a>(
        &'a self,
        override_address: Option<&'a str>,
    ) -> Result<&'a str, ConfigError> {
        if let Some(address) = override_address.map(str::trim).filter(|s| !s.is_empty()) {
            match parse_mailbox(address) {
                Ok(_) => return Ok(address),
                Err(e) => tracing::warn!("Ignoring per-email sender override: {e}"),
            }
        }

        let (key, address) = self.fallback_sender().ok_or_else(|| ConfigError::MissingRequired {
            key: "ENTITY_EMAILER_FROM_EMAIL".into(),
            hint: "Set ENTITY_EMAILER_FROM_EMAIL or DEFAULT_FROM_EMAIL".into(),
        })?;
        validate_sender(key, address)?;
        Ok(address)
    }

    fn fallback_sender(&self) -> Option<(&'static str, &str)> {
        self.default_from_address
            .as_deref()
            .map(|a| ("ENTITY_EMAILER_FROM_EMAIL", a))
            .or_else(|| {
                self.system_from_address
                    .as_deref()
                    .map(|a| ("DEFAULT_FROM_EMAIL", a))
            })
    }
}

fn validate_sender(key: &str, address: &str) -> Result<(), ConfigError> {
    parse_mailbox(address)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl SmtpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = non_empty(lookup("SMTP_HOST")).ok_or_else(|| ConfigError::MissingRequired {
            key: "SMTP_HOST".into(),
            hint: "Sending emails needs an SMTP relay".into(),
        })?;
        let port = parse_or(&lookup, "SMTP_PORT", 587)?;
        let username = non_empty(lookup("SMTP_USERNAME"));
        let password = non_empty(lookup("SMTP_PASSWORD")).map(SecretString::from);
        if username.is_some() != password.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "SMTP_USERNAME".into(),
                message: "SMTP_USERNAME and SMTP_PASSWORD must be set together".into(),
            });
        }
        Ok(Self {
            host,
            port,
            username,
            password,
        })
    }
}

/// Paths and schedules for the binary.
#[derive(Debug, Clone)]
pub struct JobScheduleConfig {
    pub db_path: PathBuf,
    pub template_dir: PathBuf,
    /// Cron expression for converting pending events.
    pub convert_schedule: String,
    /// Cron expression for sending due emails.
    pub send_schedule: String,
}

impl Default for JobScheduleConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/entity-emailer.db"),
            template_dir: PathBuf::from("./templates"),
            convert_schedule: "0 */5 * * * *".to_string(),
            send_schedule: "30 */5 * * * *".to_string(),
        }
    }
}

impl JobScheduleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            db_path: non_empty(lookup("ENTITY_EMAILER_DB_PATH"))
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            template_dir: non_empty(lookup("ENTITY_EMAILER_TEMPLATE_DIR"))
                .map(PathBuf::from)
                .unwrap_or(defaults.template_dir),
            convert_schedule: non_empty(lookup("ENTITY_EMAILER_CONVERT_CRON"))
                .unwrap_or(defaults.convert_schedule),
            send_schedule: non_empty(lookup("ENTITY_EMAILER_SEND_CRON"))
                .unwrap_or(defaults.send_schedule),
        };
        config.convert_cron()?;
        config.send_cron()?;
        Ok(config)
    }

    pub fn convert_cron(&self) -> Result<cron::Schedule, ConfigError> {
        parse_cron("ENTITY_EMAILER_CONVERT_CRON", &self.convert_schedule)
    }

    pub fn send_cron(&self) -> Result<cron::Schedule, ConfigError> {
        parse_cron("ENTITY_EMAILER_SEND_CRON", &self.send_schedule)
    }
}

fn parse_cron(key: &str, schedule: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("invalid cron expression '{schedule}': {e}"),
    })
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw}: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn emailer_defaults() {
        let config = EmailerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.email_medium_name, "email");
        assert_eq!(config.subject_truncate_length, 40);
        assert!(config.resolve_from_address(None).is_err());
    }

    #[test]
    fn default_from_email_is_the_system_sender() {
        let config =
            EmailerConfig::from_lookup(lookup(&[("DEFAULT_FROM_EMAIL", "test@example.com")]))
                .unwrap();
        assert_eq!(config.resolve_from_address(None).unwrap(), "test@example.com");
    }

    #[test]
    fn emailer_from_email_wins_over_system_sender() {
        let config = EmailerConfig::from_lookup(lookup(&[
            ("DEFAULT_FROM_EMAIL", "test@example.com"),
            ("ENTITY_EMAILER_FROM_EMAIL", "test_entity@example.com"),
        ]))
        .unwrap();
        assert_eq!(
            config.resolve_from_address(None).unwrap(),
            "test_entity@example.com"
        );
        assert_eq!(
            config.resolve_from_address(Some("override@example.com")).unwrap(),
            "override@example.com"
        );
    }

    #[test]
    fn missing_sender_is_a_config_error() {
        let config = EmailerConfig::default();
        assert!(matches!(
            config.resolve_from_address(None),
            Err(ConfigError::MissingRequired { .. })
        ));
        assert!(matches!(
            config.resolve_from_address(Some("  ")),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn unparseable_sender_is_rejected() {
        let result =
            EmailerConfig::from_lookup(lookup(&[("DEFAULT_FROM_EMAIL", "not an address")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "DEFAULT_FROM_EMAIL"
        ));

        let config = EmailerConfig {
            default_from_address: Some("not an address".into()),
            ..EmailerConfig::default()
        };
        assert!(matches!(
            config.resolve_from_address(None),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn unparseable_override_falls_back_to_configured_sender() {
        let config = EmailerConfig {
            default_from_address: Some("team@example.com".into()),
            ..EmailerConfig::default()
        };
        assert_eq!(
            config.resolve_from_address(Some("not an address")).unwrap(),
            "team@example.com"
        );
    }

    #[test]
    fn invalid_truncate_length() {
        let result =
            EmailerConfig::from_lookup(lookup(&[("ENTITY_EMAILER_SUBJECT_TRUNCATE", "abc")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn smtp_requires_host() {
        assert!(matches!(
            SmtpConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRequired { .. })
        ));
        let config = SmtpConfig::from_lookup(lookup(&[("SMTP_HOST", "smtp.example.com")])).unwrap();
        assert_eq!(config.port, 587);
        assert!(config.username.is_none());
    }

    #[test]
    fn smtp_credentials_come_in_pairs() {
        let result = SmtpConfig::from_lookup(lookup(&[
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "user"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn schedule_rejects_bad_cron() {
        let result =
            JobScheduleConfig::from_lookup(lookup(&[("ENTITY_EMAILER_SEND_CRON", "not cron")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        assert!(JobScheduleConfig::from_lookup(lookup(&[])).is_ok());
    }
}
