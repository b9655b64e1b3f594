use std::net::IpAddr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub statuscast_env: String,
    pub api_bind: String,
    pub admin_token: String,
    pub page_base_domain: String,
    pub verification_ttl_days: i64,
    pub webhook_timeout_secs: u64,
    pub email_api_url: String,
    pub email_api_key: String,
    pub email_from: String,
    pub email_batch_size: usize,
    pub worker_concurrency: usize,
    pub dispatch_channel: String,
    pub run_migrations: bool,
    pub rate_limit_subscribe: u32,
    /// Reverse proxies whose `X-Forwarded-For` is believed.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Settings {
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("STATUSCAST_DATABASE_URL"))?;
        let redis_url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("STATUSCAST_REDIS_URL"))
            .ok()
            .filter(|url| !url.is_empty());
        let statuscast_env =
            std::env::var("STATUSCAST_ENV").unwrap_or_else(|_| "dev".to_string());
        let api_bind =
            std::env::var("STATUSCAST_API_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let admin_token = std::env::var("STATUSCAST_ADMIN_TOKEN")?;
        let page_base_domain = std::env::var("STATUSCAST_PAGE_BASE_DOMAIN")
            .unwrap_or_else(|_| "openstatus.dev".to_string());
        let verification_ttl_days = parse_or("STATUSCAST_VERIFICATION_TTL_DAYS", 7);
        let webhook_timeout_secs = parse_or("STATUSCAST_WEBHOOK_TIMEOUT_SECS", 10);
        let email_api_url = std::env::var("STATUSCAST_EMAIL_API_URL")
            .unwrap_or_else(|_| "https://api.resend.com".to_string());
        let email_api_key = std::env::var("STATUSCAST_EMAIL_API_KEY")?;
        let email_from = std::env::var("STATUSCAST_EMAIL_FROM").unwrap_or_else(|_| {
            "OpenStatus <notifications@notifications.openstatus.dev>".to_string()
        });
        let email_batch_size = parse_or("STATUSCAST_EMAIL_BATCH_SIZE", 100);
        let worker_concurrency = parse_or("STATUSCAST_WORKER_CONCURRENCY", 4);
        let dispatch_channel = std::env::var("STATUSCAST_DISPATCH_CHANNEL")
            .unwrap_or_else(|_| "page_updates".to_string());
        let run_migrations = parse_or("STATUSCAST_RUN_MIGRATIONS", false);
        let rate_limit_subscribe = parse_or("STATUSCAST_RATE_LIMIT_SUBSCRIBE", 10);
        let trusted_proxies = std::env::var("STATUSCAST_TRUSTED_PROXIES")
            .map(|value| parse_ip_list(&value))
            .unwrap_or_default();

        Ok(Self {
            database_url,
            redis_url,
            statuscast_env,
            api_bind,
            admin_token,
            page_base_domain,
            verification_ttl_days,
            webhook_timeout_secs,
            email_api_url,
            email_api_key,
            email_from,
            email_batch_size,
            worker_concurrency,
            dispatch_channel,
            run_migrations,
            rate_limit_subscribe,
            trusted_proxies,
        })
    }

    pub fn is_production(&self) -> bool {
        self.statuscast_env == "production"
    }

    pub fn verification_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.verification_ttl_days.max(1))
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Comma-separated addresses; entries that do not parse are dropped.
fn parse_ip_list(value: &str) -> Vec<IpAddr> {
    value
        .split(',')
        .filter_map(|entry| entry.trim().parse().ok())
        .collect()
}
