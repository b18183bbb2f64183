//! Configuration types.
//!
//! Everything comes from environment variables and is read once at startup
//! into an immutable [`RelayConfig`]; components receive the pieces they need
//! at construction.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::message_id::MIN_SECRET_SIZE;
use crate::outbound::dispatch::{DispatchConfig, RetryPolicy};
use crate::webhook::payload::AttachmentLimits;

/// Bytes of master secret generated on first run.
const GENERATED_SECRET_SIZE: usize = 64;

/// Outbound provider settings.
#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: SecretString,
    pub endpoint: String,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The single domain this relay serves.
    pub mailer_domain: String,
    /// Webhook path.
    pub receive_endpoint: String,
    pub listen_addr: SocketAddr,
    /// Display name used when the From header carries none.
    pub default_name: String,
    /// Whether directory members may reply out through their aliases.
    pub allow_outbound: bool,
    /// Keep attachments in memory and never persist the master secret.
    pub no_disk: bool,
    pub users_path: PathBuf,
    pub key_path: PathBuf,
    /// Hex master secret supplied through the environment.
    pub decrypt_key: Option<SecretString>,
    pub webhook_signing_key: SecretString,
    /// Reject webhook timestamps older than this, when set.
    pub webhook_max_age_secs: Option<u64>,
    pub mailgun: MailgunConfig,
    pub attachments: AttachmentLimits,
    pub dispatch: DispatchConfig,
}

impl RelayConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mailer_domain = var("MAILER_DOMAIN")
            .map(|d| d.trim().to_ascii_lowercase())
            .ok_or_else(|| ConfigError::MissingEnvVar("MAILER_DOMAIN".into()))?;

        let receive_endpoint =
            var("RECEIVE_ENDPOINT").unwrap_or_else(|| "/api/receive-mail".to_string());
        if !receive_endpoint.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "RECEIVE_ENDPOINT".into(),
                message: "must start with '/'".into(),
            });
        }

        let webhook_signing_key = var("MAILGUN_WEBHOOK_SIGNING_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("MAILGUN_WEBHOOK_SIGNING_KEY".into()))?;
        let api_key = var("MAILGUN_API_KEY")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("MAILGUN_API_KEY".into()))?;

        let defaults = DispatchConfig::default();
        let retry_defaults = RetryPolicy::default();
        let limit_defaults = AttachmentLimits::default();

        Ok(Self {
            mailer_domain,
            receive_endpoint,
            listen_addr: parse_var(&var, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            default_name: var("DEFAULT_NAME").unwrap_or_else(|| "No Name".to_string()),
            allow_outbound: parse_flag(&var, "ALLOW_OUTBOUND_MAIL")?,
            no_disk: parse_flag(&var, "NO_DISK")?,
            users_path: var("USERS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("users.json")),
            key_path: var("KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("key")),
            decrypt_key: var("DECRYPT_KEY").map(SecretString::from),
            webhook_signing_key,
            webhook_max_age_secs: var("WEBHOOK_MAX_AGE_SECS")
                .map(|v| parse_value::<u64>("WEBHOOK_MAX_AGE_SECS", &v))
                .transpose()?,
            mailgun: MailgunConfig {
                api_key,
                endpoint: var("MAILGUN_API_ENDPOINT")
                    .map(|e| e.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| "https://api.mailgun.net".to_string()),
            },
            attachments: AttachmentLimits {
                max_bytes: parse_var(&var, "MAX_ATTACHMENT_BYTES", limit_defaults.max_bytes)?,
                max_count: parse_var(&var, "MAX_ATTACHMENTS", limit_defaults.max_count)?,
            },
            dispatch: DispatchConfig {
                queue_capacity: parse_var(
                    &var,
                    "DISPATCH_QUEUE_CAPACITY",
                    defaults.queue_capacity,
                )?
                .max(1),
                concurrency: parse_var(&var, "DISPATCH_CONCURRENCY", defaults.concurrency)?.max(1),
                retry: RetryPolicy {
                    max_attempts: parse_var(&var, "SEND_MAX_ATTEMPTS", retry_defaults.max_attempts)?
                        .max(1),
                    base_delay: Duration::from_millis(parse_var(
                        &var,
                        "SEND_RETRY_BASE_MS",
                        retry_defaults.base_delay.as_millis() as u64,
                    )?),
                    max_delay: retry_defaults.max_delay,
                },
            },
        })
    }

    /// Load, read or create the master secret for the message-id cipher.
    ///
    /// Order: `DECRYPT_KEY`, then the key file, then a freshly generated
    /// secret which is persisted unless `NO_DISK` is set.
    pub fn load_master_secret(&self) -> Result<SecretSlice<u8>, ConfigError> {
        let bytes = if let Some(hex_key) = &self.decrypt_key {
            warn!(
                "Master secret supplied through DECRYPT_KEY; prefer a key file unless the disk is read-only"
            );
            decode_secret(hex_key.expose_secret())?
        } else if self.key_path.exists() {
            let raw = std::fs::read_to_string(&self.key_path).map_err(|source| ConfigError::Io {
                path: self.key_path.clone(),
                source,
            })?;
            decode_secret(&raw)?
        } else {
            let mut generated = vec![0u8; GENERATED_SECRET_SIZE];
            OsRng.fill_bytes(&mut generated);
            if self.no_disk {
                warn!("No master secret configured and NO_DISK is set; using an ephemeral secret");
            } else {
                persist_secret(&self.key_path, &generated)?;
                info!(path = %self.key_path.display(), "Generated new master secret");
            }
            generated
        };

        if bytes.len() < MIN_SECRET_SIZE {
            return Err(ConfigError::SecretTooShort {
                actual: bytes.len(),
                min: MIN_SECRET_SIZE,
            });
        }
        Ok(SecretSlice::from(bytes))
    }
}

fn decode_secret(hex_key: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(hex_key.trim()).map_err(|e| ConfigError::UndecodableSecret(e.to_string()))
}

fn persist_secret(path: &Path, secret: &[u8]) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(io_err)?;
        file.write_all(hex::encode(secret).as_bytes())
            .map_err(io_err)
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, hex::encode(secret)).map_err(io_err)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_flag<F>(var: &F, key: &str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = var(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
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

    const REQUIRED: &[(&str, &str)] = &[
        ("MAILER_DOMAIN", "Proxy.TLD"),
        ("MAILGUN_WEBHOOK_SIGNING_KEY", "signing"),
        ("MAILGUN_API_KEY", "api"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(extra);
        pairs
    }

    #[test]
    fn defaults_apply() {
        let config = RelayConfig::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(config.mailer_domain, "proxy.tld");
        assert_eq!(config.receive_endpoint, "/api/receive-mail");
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.default_name, "No Name");
        assert!(!config.allow_outbound);
        assert!(!config.no_disk);
        assert_eq!(config.users_path, PathBuf::from("users.json"));
        assert_eq!(config.mailgun.endpoint, "https://api.mailgun.net");
        assert!(config.webhook_max_age_secs.is_none());
        assert_eq!(config.dispatch.retry.max_attempts, 3);
    }

    #[test]
    fn mailer_domain_is_required() {
        let result = RelayConfig::from_lookup(lookup(&[
            ("MAILGUN_WEBHOOK_SIGNING_KEY", "signing"),
            ("MAILGUN_API_KEY", "api"),
        ]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(k)) if k == "MAILER_DOMAIN"));

        let result = RelayConfig::from_lookup(lookup(&[
            ("MAILER_DOMAIN", "  "),
            ("MAILGUN_WEBHOOK_SIGNING_KEY", "signing"),
            ("MAILGUN_API_KEY", "api"),
        ]));
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn signing_key_is_required() {
        let result = RelayConfig::from_lookup(lookup(&[
            ("MAILER_DOMAIN", "proxy.tld"),
            ("MAILGUN_API_KEY", "api"),
        ]));
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(k)) if k == "MAILGUN_WEBHOOK_SIGNING_KEY")
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = RelayConfig::from_lookup(lookup(&with(&[
            ("ALLOW_OUTBOUND_MAIL", "true"),
            ("NO_DISK", "1"),
            ("LISTEN_ADDR", "127.0.0.1:8025"),
            ("MAX_ATTACHMENTS", "3"),
            ("WEBHOOK_MAX_AGE_SECS", "600"),
            ("SEND_MAX_ATTEMPTS", "0"),
            ("MAILGUN_API_ENDPOINT", "https://api.eu.mailgun.net/"),
        ])))
        .unwrap();
        assert!(config.allow_outbound);
        assert!(config.no_disk);
        assert_eq!(config.listen_addr.port(), 8025);
        assert_eq!(config.attachments.max_count, 3);
        assert_eq!(config.webhook_max_age_secs, Some(600));
        assert_eq!(config.dispatch.retry.max_attempts, 1);
        assert_eq!(config.mailgun.endpoint, "https://api.eu.mailgun.net");
    }

    #[test]
    fn unparseable_values_are_errors() {
        let result = RelayConfig::from_lookup(lookup(&with(&[("MAX_ATTACHMENTS", "many")])));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "MAX_ATTACHMENTS"));

        let result = RelayConfig::from_lookup(lookup(&with(&[("NO_DISK", "perhaps")])));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "NO_DISK"));

        let result = RelayConfig::from_lookup(lookup(&with(&[("RECEIVE_ENDPOINT", "hook")])));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn master_secret_from_environment() {
        let hex_key = "ab".repeat(32);
        let mut pairs: Vec<(&str, &str)> = REQUIRED.to_vec();
        pairs.push(("DECRYPT_KEY", hex_key.as_str()));
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        let secret = config.load_master_secret().unwrap();
        assert_eq!(secret.expose_secret(), vec![0xab; 32].as_slice());
    }

    #[test]
    fn master_secret_must_decode_and_be_long_enough() {
        let config = RelayConfig::from_lookup(lookup(&with(&[("DECRYPT_KEY", "zz")]))).unwrap();
        assert!(matches!(
            config.load_master_secret(),
            Err(ConfigError::UndecodableSecret(_))
        ));

        let config = RelayConfig::from_lookup(lookup(&with(&[("DECRYPT_KEY", "abcd")]))).unwrap();
        assert!(matches!(
            config.load_master_secret(),
            Err(ConfigError::SecretTooShort { actual: 2, .. })
        ));
    }

    #[test]
    fn master_secret_is_generated_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::from_lookup(lookup(REQUIRED)).unwrap();
        config.key_path = dir.path().join("key");

        let first = config.load_master_secret().unwrap();
        assert_eq!(first.expose_secret().len(), GENERATED_SECRET_SIZE);
        let stored = std::fs::read_to_string(&config.key_path).unwrap();
        assert_eq!(stored, hex::encode(first.expose_secret()));

        let second = config.load_master_secret().unwrap();
        assert_eq!(first.expose_secret(), second.expose_secret());
    }

    #[test]
    fn no_disk_secret_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::from_lookup(lookup(REQUIRED)).unwrap();
        config.key_path = dir.path().join("key");
        config.no_disk = true;

        config.load_master_secret().unwrap();
        assert!(!config.key_path.exists());
    }
}
