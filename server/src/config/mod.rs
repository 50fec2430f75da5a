use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod cors;
pub mod security;
pub mod tenant;

pub use cors::create_cors_layer;
pub use security::with_security_headers;
pub use tenant::{ApiKey, ApiPermission, TenantConfig, TenantContext, TenantError, TenantRegistry};

const DEFAULT_PROVIDER_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:3001";

/// Timeouts applied to each external collaborator independently.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimeouts {
    pub provider: Duration,
    pub ledger: Duration,
    pub cashless: Duration,
    pub notify: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            provider: Duration::from_millis(10_000),
            ledger: Duration::from_millis(5_000),
            cashless: Duration::from_millis(5_000),
            notify: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    /// Base of the return links handed to the hosted checkout page.
    pub public_url: String,
    pub tenants_file: Option<PathBuf>,
    pub root_payment_api_key: Option<String>,
    pub provider_api_base: String,
    pub webhook_secret: Option<String>,
    pub timeouts: ServiceTimeouts,
    pub reconcile_interval: Duration,
    /// Age after which a PAID attempt still being processed is picked up
    /// again by the reconciliation sweep.
    pub reconcile_stale_after: Duration,
    pub webhook_max_attempts: u32,
    pub cors_allowed_origins: Option<String>,
    pub production: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/tibillet".to_string()),
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", 5),
            bind_addr: parsed("BIND_ADDR", default_bind_addr()),
            public_url: env::var("PUBLIC_URL").unwrap_or_else(|_| DEFAULT_PUBLIC_URL.to_string()),
            tenants_file: env::var("TENANTS_FILE").ok().map(PathBuf::from),
            root_payment_api_key: env::var("ROOT_STRIPE_API_KEY").ok(),
            provider_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_PROVIDER_API_BASE.to_string()),
            webhook_secret: env::var("STRIPE_WEBHOOK_SECRET").ok(),
            timeouts: ServiceTimeouts {
                provider: Duration::from_millis(parsed("PROVIDER_TIMEOUT_MS", 10_000)),
                ledger: Duration::from_millis(parsed("LEDGER_TIMEOUT_MS", 5_000)),
                cashless: Duration::from_millis(parsed("CASHLESS_TIMEOUT_MS", 5_000)),
                notify: Duration::from_millis(parsed("NOTIFY_TIMEOUT_MS", 5_000)),
            },
            reconcile_interval: interval_secs("RECONCILE_INTERVAL_SECS", 300),
            reconcile_stale_after: Duration::from_secs(parsed("RECONCILE_STALE_SECS", 300)),
            webhook_max_attempts: parsed("WEBHOOK_MAX_ATTEMPTS", 3),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS").ok(),
            production: env::var("RUST_ENV")
                .map(|v| v.to_lowercase() == "production")
                .unwrap_or(false),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}

/// Interval read in seconds. Zero is raised to one second, as a ticker
/// cannot run on a zero period.
fn interval_secs(key: &str, default: u64) -> Duration {
    let secs = parsed(key, default);
    if secs == 0 {
        tracing::warn!(key, "Interval of 0 seconds raised to 1");
    }
    Duration::from_secs(secs.max(1))
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}
