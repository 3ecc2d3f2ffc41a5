use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SESSION_TTL_SECS: u64 = 300;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_MAILBOX_TTL_SECS: u64 = 300;
const DEFAULT_MAILBOX_IDLE_EXTENSION_SECS: u64 = 60;
const DEFAULT_MAILBOX_MAX_LIFETIME_SECS: u64 = 600;
const DEFAULT_RENDEZVOUS_TTL_SECS: u64 = 30;
const DEFAULT_MAX_QUEUE_LEN: usize = 128;
const DEFAULT_MAX_SESSIONS: u64 = 10_000;
const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 15;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;
const DEFAULT_REDIS_KEY_PREFIX: &str = "paircast";
const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_MAX_SUBSCRIBERS_PER_MAILBOX: usize = 4;

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str),
    RedisTlsRequired,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(key) => write!(f, "configuration value invalid: {}", key),
            Self::RedisTlsRequired => {
                write!(f, "redis tls required but url is not rediss://")
            }
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub window: Duration,
    pub penalty: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// `/register`, keyed by source address.
    pub register: RateLimitSettings,
    /// `/connection/*` and `/heartbeat`, keyed by client or source.
    pub connection: RateLimitSettings,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            register: RateLimitSettings {
                burst: 10,
                window: Duration::from_secs(60),
                penalty: Duration::ZERO,
            },
            connection: RateLimitSettings {
                burst: 60,
                window: Duration::from_secs(1),
                penalty: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub public_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub session_idle_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub mailbox_ttl: Duration,
    pub mailbox_idle_extension: Duration,
    pub mailbox_max_lifetime: Duration,
    pub rendezvous_ttl: Duration,
    pub max_queue_len: usize,
    pub max_sessions: u64,
    pub request_deadline: Duration,
    pub sweep_interval: Duration,
    pub subscriber_channel_capacity: usize,
    pub max_subscribers_per_mailbox: usize,
    pub rate_limits: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            public_url: None,
            redis_url: None,
            redis_key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
            session_idle_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            mailbox_ttl: Duration::from_secs(DEFAULT_MAILBOX_TTL_SECS),
            mailbox_idle_extension: Duration::from_secs(DEFAULT_MAILBOX_IDLE_EXTENSION_SECS),
            mailbox_max_lifetime: Duration::from_secs(DEFAULT_MAILBOX_MAX_LIFETIME_SECS),
            rendezvous_ttl: Duration::from_secs(DEFAULT_RENDEZVOUS_TTL_SECS),
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            max_sessions: DEFAULT_MAX_SESSIONS,
            request_deadline: Duration::from_secs(DEFAULT_REQUEST_DEADLINE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            subscriber_channel_capacity: DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
            max_subscribers_per_mailbox: DEFAULT_MAX_SUBSCRIBERS_PER_MAILBOX,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

/// Loads server configuration from `SIGNALING_*` environment variables.
/// Unset variables fall back to defaults; set-but-unparsable values are
/// rejected rather than silently defaulted.
pub fn load_from_env() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    let port = parse_env("SIGNALING_PORT", DEFAULT_PORT)?;
    let ip = match env::var("SIGNALING_ADDR") {
        Ok(raw) => raw
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Invalid("SIGNALING_ADDR"))?,
        Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    config.bind_addr = SocketAddr::new(ip, port);

    config.public_url = env::var("SIGNALING_PUBLIC_URL").ok().filter(|v| !v.is_empty());
    config.redis_url = env::var("SIGNALING_REDIS_URL").ok().filter(|v| !v.is_empty());
    if let Ok(raw) = env::var("SIGNALING_REDIS_KEY_PREFIX") {
        if raw.is_empty() || raw.contains(':') {
            return Err(ConfigError::Invalid("SIGNALING_REDIS_KEY_PREFIX"));
        }
        config.redis_key_prefix = raw;
    }

    let require_tls = parse_env("SIGNALING_REDIS_REQUIRE_TLS", false)?;
    if require_tls {
        match config.redis_url.as_deref() {
            Some(url) if url.starts_with("rediss://") => {}
            _ => return Err(ConfigError::RedisTlsRequired),
        }
    }

    config.session_idle_ttl =
        Duration::from_secs(parse_env("SIGNALING_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?);
    config.heartbeat_interval =
        Duration::from_secs(parse_env("SIGNALING_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?);
    config.mailbox_ttl =
        Duration::from_secs(parse_env("SIGNALING_MAILBOX_TTL_SECS", DEFAULT_MAILBOX_TTL_SECS)?);
    config.mailbox_idle_extension = Duration::from_secs(parse_env(
        "SIGNALING_MAILBOX_IDLE_EXTENSION_SECS",
        DEFAULT_MAILBOX_IDLE_EXTENSION_SECS,
    )?);
    config.mailbox_max_lifetime = Duration::from_secs(parse_env(
        "SIGNALING_MAILBOX_MAX_LIFETIME_SECS",
        DEFAULT_MAILBOX_MAX_LIFETIME_SECS,
    )?);
    config.rendezvous_ttl = Duration::from_secs(parse_env(
        "SIGNALING_RENDEZVOUS_TTL_SECS",
        DEFAULT_RENDEZVOUS_TTL_SECS,
    )?);
    config.max_queue_len = parse_env("SIGNALING_MAX_QUEUE_LEN", DEFAULT_MAX_QUEUE_LEN)?;
    config.max_sessions = parse_env("SIGNALING_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?;
    config.request_deadline = Duration::from_secs(parse_env(
        "SIGNALING_REQUEST_DEADLINE_SECS",
        DEFAULT_REQUEST_DEADLINE_SECS,
    )?);
    config.sweep_interval = Duration::from_secs(parse_env(
        "SIGNALING_SWEEP_INTERVAL_SECS",
        DEFAULT_SWEEP_INTERVAL_SECS,
    )?);

    if config.max_queue_len == 0 {
        return Err(ConfigError::Invalid("SIGNALING_MAX_QUEUE_LEN"));
    }
    if config.mailbox_max_lifetime < config.mailbox_ttl {
        return Err(ConfigError::Invalid("SIGNALING_MAILBOX_MAX_LIFETIME_SECS"));
    }

    Ok(config)
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}
