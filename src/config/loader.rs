use std::env;

use url::Url;

use super::env::{
    AppConfig, ClientLimitConfig, ConfigError, IpRange, LoggingConfig, OriginLimitConfig,
    SolverConfig,
};

pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::from_env()
}

impl AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let listen_address =
            env::var("WEBSERVER_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let debug = parse_bool("DEBUG");

        let proxy = env::var("PROXY").ok().filter(|v| !v.is_empty());
        if let Some(proxy) = &proxy {
            validate_proxy(proxy)?;
        }

        let solver = SolverConfig {
            url: env::var("SOLVER_URL").unwrap_or_else(|_| "http://localhost:8191".to_string()),
            max_timeout_ms: parse_number("SOLVER_MAX_TIMEOUT_MS", 60_000, |v: u64| v > 0)?,
            wait_seconds: parse_number("SOLVER_WAIT_SECONDS", 0, |_: u64| true)?,
        };

        let client_limit = ClientLimitConfig {
            every_seconds: parse_number("TASK_RATE_LIMIT_EVERY", 60.0, |v: f64| v > 0.0)?,
            burst: parse_number("TASK_RATE_LIMIT_BURST", 10, |_: u32| true)?,
        };

        let origin_limit = OriginLimitConfig {
            every_seconds: parse_number("PER_DOMAIN_RATE_LIMIT_EVERY", 2.0, |v: f64| v > 0.0)?,
            capacity: parse_number("PER_DOMAIN_RATE_LIMIT_CAPACITY", 10, |v: u32| v > 0)?,
        };

        let trusted_ip_ranges = env::var("TRUSTED_IP_RANGES")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| {
                        part.parse::<IpRange>().map_err(|reason| ConfigError::Invalid {
                            key: "TRUSTED_IP_RANGES",
                            reason,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let real_ip_header = env::var("REAL_IP_HEADER").ok().filter(|v| !v.is_empty());

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL")
                .unwrap_or_else(|_| if debug { "debug" } else { "info" }.to_string()),
            logs_dir: env::var("LOGS_DIR").unwrap_or_else(|_| "logs".to_string()),
        };

        Ok(Self {
            listen_address,
            redis_url,
            debug,
            proxy,
            solver,
            client_limit,
            origin_limit,
            trusted_ip_ranges,
            real_ip_header,
            logging,
        })
    }
}

fn parse_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn parse_number<T>(key: &'static str, default: T, valid: impl Fn(T) -> bool) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Copy,
{
    let value = match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("{raw:?} is not a number"),
        })?,
        Err(_) => default,
    };
    if !valid(value) {
        return Err(ConfigError::Invalid {
            key,
            reason: "out of range".to_string(),
        });
    }
    Ok(value)
}

fn validate_proxy(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "PROXY",
        reason: reason.to_string(),
    };
    let parsed = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https" | "socks") {
        return Err(invalid(&format!("unsupported scheme {:?}", parsed.scheme())));
    }
    if parsed.cannot_be_a_base() {
        return Err(invalid("opaque proxy url"));
    }
    if parsed.path() != "" && parsed.path() != "/" {
        return Err(invalid("proxy url must not carry a path"));
    }
    Ok(())
}
