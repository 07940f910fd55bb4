use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset selects the in-memory store.
    pub database_url: Option<String>,
    pub slack_token: String,
    pub slack_signing_secret: String,
    pub slack_api_base_url: String,
    pub ops_channel: String,
    /// Domain shown in generated webhook URLs. Falls back to the request host.
    pub custom_domain: Option<String>,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub reconcile_interval: Option<Duration>,
}

/// Outbound HTTP policy for the Slack client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
    /// Covers connect through reading the response body, per attempt.
    pub read_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            wait_min: Duration::from_millis(1000),
            wait_max: Duration::from_millis(10_000),
            read_timeout: Duration::from_millis(5000),
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{} must be set", key))
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The store setting alone. Token administration needs nothing else, so it
/// does not require the Slack credentials.
pub fn database_url() -> anyhow::Result<Option<String>> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
    if database_url.is_none() {
        let env_mode = std::env::var("HOOKRELAY_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "DATABASE_URL is not set. The in-memory store loses every token on restart \
                 and is refused in production."
            );
        }
    }
    Ok(database_url)
}

pub fn load() -> anyhow::Result<Config> {
    let database_url = database_url()?;

    let defaults = RetryConfig::default();
    let retry = RetryConfig {
        max_retries: parsed("HOOKRELAY_RETRY_MAX", defaults.max_retries),
        wait_min: Duration::from_millis(parsed(
            "HOOKRELAY_RETRY_WAIT_MIN_MS",
            defaults.wait_min.as_millis() as u64,
        )),
        wait_max: Duration::from_millis(parsed(
            "HOOKRELAY_RETRY_WAIT_MAX_MS",
            defaults.wait_max.as_millis() as u64,
        )),
        read_timeout: Duration::from_millis(parsed(
            "HOOKRELAY_READ_TIMEOUT_MS",
            defaults.read_timeout.as_millis() as u64,
        )),
    };
    if retry.wait_min > retry.wait_max {
        anyhow::bail!("HOOKRELAY_RETRY_WAIT_MIN_MS must not exceed HOOKRELAY_RETRY_WAIT_MAX_MS");
    }

    Ok(Config {
        port: parsed("HOOKRELAY_PORT", 3000),
        database_url,
        slack_token: required("SLACK_TOKEN")?,
        slack_signing_secret: required("SLACK_SIGNING_SECRET")?,
        slack_api_base_url: std::env::var("SLACK_API_BASE_URL")
            .unwrap_or_else(|_| "https://slack.com/api".into()),
        ops_channel: required("HOOKRELAY_OPS_CHANNEL")?,
        custom_domain: std::env::var("HOOKRELAY_CUSTOM_DOMAIN")
            .ok()
            .filter(|s| !s.is_empty()),
        retry,
        request_timeout: Duration::from_secs(parsed("HOOKRELAY_REQUEST_TIMEOUT_SECS", 30)),
        reconcile_interval: std::env::var("HOOKRELAY_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs),
    })
}
