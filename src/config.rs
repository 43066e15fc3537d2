//! Configuration types, read from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// SQLite/libSQL database file.
    pub db_path: PathBuf,
    /// Port for the REST API.
    pub http_port: u16,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    pub delivery: DeliveryConfig,
    pub telegram: Option<TelegramConfig>,
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsGatewayConfig>,
}

/// Retry and timeout policy for deliveries.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Retries allowed after the first dispatch.
    pub max_retries: u32,
    /// First retry delay; doubles with each retry.
    pub retry_base: Duration,
    /// Upper bound on a single retry delay.
    pub retry_cap: Duration,
    /// Bound on every individual channel call.
    pub dispatch_timeout: Duration,
    /// How often the retry worker polls for due attempts.
    pub poll_interval: Duration,
    /// How long a claimed attempt stays leased to one worker.
    pub lease: Duration,
    /// Maximum attempts claimed per poll.
    pub batch_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600), // 1 hour
            dispatch_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            lease: Duration::from_secs(60),
            batch_size: 32,
        }
    }
}

impl DeliveryConfig {
    /// Backoff before the next retry: `min(base * 2^retry_count, cap)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_base
            .checked_mul(factor)
            .map_or(self.retry_cap, |d| d.min(self.retry_cap))
    }
}

/// Telegram Bot API credentials.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub api_base: String,
}

/// Outbound SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

/// Twilio-compatible outbound SMS gateway.
#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
}

impl RelayConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/sms-relay.db"));
        let http_port = parse_or(&lookup, "RELAY_HTTP_PORT", 8080u16)?;
        let log_dir = lookup("RELAY_LOG_DIR").map(PathBuf::from);

        let defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            max_retries: parse_or(&lookup, "RELAY_MAX_RETRIES", defaults.max_retries)?,
            retry_base: secs_or(&lookup, "RELAY_RETRY_BASE_SECS", defaults.retry_base)?,
            retry_cap: secs_or(&lookup, "RELAY_RETRY_CAP_SECS", defaults.retry_cap)?,
            dispatch_timeout: secs_or(
                &lookup,
                "RELAY_DISPATCH_TIMEOUT_SECS",
                defaults.dispatch_timeout,
            )?,
            poll_interval: secs_or(&lookup, "RELAY_RETRY_POLL_SECS", defaults.poll_interval)?,
            lease: secs_or(&lookup, "RELAY_LEASE_SECS", defaults.lease)?,
            batch_size: parse_or(&lookup, "RELAY_RETRY_BATCH", defaults.batch_size)?,
        };
        if delivery.retry_cap < delivery.retry_base {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RETRY_CAP_SECS".into(),
                message: "must be >= RELAY_RETRY_BASE_SECS".into(),
            });
        }
        if delivery.dispatch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_DISPATCH_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if delivery.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_RETRY_POLL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        // A lease that can expire mid-dispatch lets a second worker resend.
        if delivery.lease <= delivery.dispatch_timeout {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_LEASE_SECS".into(),
                message: "must exceed RELAY_DISPATCH_TIMEOUT_SECS".into(),
            });
        }

        let telegram = lookup("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            bot_token: SecretString::from(token),
            api_base: lookup("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
        });

        let smtp = match lookup("SMTP_HOST") {
            Some(host) => {
                let username = lookup("SMTP_USERNAME").unwrap_or_default();
                Some(SmtpConfig {
                    port: parse_or(&lookup, "SMTP_PORT", 587u16)?,
                    password: SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default()),
                    from_address: lookup("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
                    username,
                    host,
                })
            }
            None => None,
        };

        let sms = match lookup("SMS_GATEWAY_URL") {
            Some(base_url) => Some(SmsGatewayConfig {
                base_url,
                account_sid: require(&lookup, "SMS_ACCOUNT_SID")?,
                auth_token: SecretString::from(require(&lookup, "SMS_AUTH_TOKEN")?),
                from_number: require(&lookup, "SMS_FROM_NUMBER")?,
            }),
            None => None,
        };

        Ok(Self {
            db_path,
            http_port,
            log_dir,
            delivery,
            telegram,
            smtp,
            sms,
        })
    }
}

fn require<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}
