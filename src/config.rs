use crate::domain::{Decimal, RoundingMode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub reconciler_interval: Duration,
    pub intake_queue_capacity: usize,
    pub intake_workers: usize,
    /// How long a queued submission waits for its worker's answer.
    pub intake_reply_deadline: Duration,
    pub store_call_deadline: Duration,
    pub retry_backoff: Vec<Duration>,
    pub retry_max_attempts: u32,
    pub rounding_mode: RoundingMode,
    /// Per-generation percentages seeded when the store has no schedule.
    pub rate_schedule_pct: [Decimal; 3],
    pub notify_webhook_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    /// Defaults for everything but the database location.
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            port: 8080,
            database_path: database_path.into(),
            reconciler_interval: Duration::from_secs(15 * 60),
            intake_queue_capacity: 10_000,
            intake_workers: 4,
            intake_reply_deadline: Duration::from_secs(30),
            store_call_deadline: Duration::from_secs(5),
            retry_backoff: vec![
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_secs(1),
            ],
            retry_max_attempts: 5,
            rounding_mode: RoundingMode::HalfEven,
            rate_schedule_pct: [Decimal::from(15), Decimal::from(3), Decimal::from(2)],
            notify_webhook_url: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;
        let mut config = Config::new(database_path);

        config.port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        if let Some(ms) = parse_u64(&env_map, "RECONCILER_INTERVAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::InvalidValue(
                    "RECONCILER_INTERVAL_MS".to_string(),
                    "must be > 0".to_string(),
                ));
            }
            config.reconciler_interval = Duration::from_millis(ms);
        }

        if let Some(n) = parse_positive(&env_map, "INTAKE_QUEUE_CAPACITY")? {
            config.intake_queue_capacity = n as usize;
        }

        if let Some(n) = parse_positive(&env_map, "INTAKE_WORKERS")? {
            config.intake_workers = n as usize;
        }

        if let Some(ms) = parse_positive(&env_map, "INTAKE_REPLY_DEADLINE_MS")? {
            config.intake_reply_deadline = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_positive(&env_map, "STORE_CALL_DEADLINE_MS")? {
            config.store_call_deadline = Duration::from_millis(ms);
        }

        if let Some(raw) = env_map.get("RETRY_BACKOFF_MS") {
            config.retry_backoff = parse_backoff(raw)?;
        }

        if let Some(n) = parse_positive(&env_map, "RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = u32::try_from(n).map_err(|_| {
                ConfigError::InvalidValue(
                    "RETRY_MAX_ATTEMPTS".to_string(),
                    "must fit in u32".to_string(),
                )
            })?;
        }

        if let Some(raw) = env_map.get("ROUNDING_MODE") {
            config.rounding_mode = raw
                .parse::<RoundingMode>()
                .map_err(|e| ConfigError::InvalidValue("ROUNDING_MODE".to_string(), e))?;
        }

        if let Some(raw) = env_map.get("RATE_SCHEDULE") {
            config.rate_schedule_pct = parse_rate_schedule(raw)?;
        }

        config.notify_webhook_url = env_map
            .get("NOTIFY_WEBHOOK_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(config)
    }
}

fn parse_u64(env_map: &HashMap<String, String>, key: &str) -> Result<Option<u64>, ConfigError> {
    env_map
        .get(key)
        .map(|s| {
            s.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(key.to_string(), "must be a valid u64".to_string())
            })
        })
        .transpose()
}

fn parse_positive(
    env_map: &HashMap<String, String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    match parse_u64(env_map, key)? {
        Some(0) => Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be >= 1".to_string(),
        )),
        other => Ok(other),
    }
}

fn parse_backoff(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let delays = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                ConfigError::InvalidValue(
                    "RETRY_BACKOFF_MS".to_string(),
                    format!("not a millisecond count: {}", s),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if delays.is_empty() {
        return Err(ConfigError::InvalidValue(
            "RETRY_BACKOFF_MS".to_string(),
            "at least one delay is required".to_string(),
        ));
    }
    Ok(delays)
}

fn parse_rate_schedule(raw: &str) -> Result<[Decimal; 3], ConfigError> {
    let invalid = |msg: String| ConfigError::InvalidValue("RATE_SCHEDULE".to_string(), msg);

    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(invalid(format!(
            "expected three comma-separated percentages, got {}",
            parts.len()
        )));
    }

    let mut rates = [Decimal::zero(); 3];
    for (i, part) in parts.iter().enumerate() {
        let pct = Decimal::from_str_canonical(part)
            .map_err(|_| invalid(format!("not a decimal: {}", part)))?;
        if pct.is_negative() || pct > Decimal::hundred() {
            return Err(invalid(format!("must be within 0..=100: {}", part)));
        }
        rates[i] = pct;
    }
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.reconciler_interval, Duration::from_secs(900));
        assert_eq!(config.intake_queue_capacity, 10_000);
        assert_eq!(config.store_call_deadline, Duration::from_secs(5));
        assert_eq!(config.intake_reply_deadline, Duration::from_secs(30));
        assert_eq!(
            config.retry_backoff,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(200),
                Duration::from_millis(1000)
            ]
        );
        assert_eq!(config.retry_max_attempts, 5);
        assert_eq!(config.rounding_mode, RoundingMode::HalfEven);
        assert_eq!(config.rate_schedule_pct[0].to_canonical_string(), "15");
        assert!(config.notify_webhook_url.is_none());
    }

    #[test]
    fn test_missing_database_path() {
        let result = Config::from_env_map(HashMap::new());
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "PORT"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_intake_reply_deadline_override() {
        let mut env_map = setup_required_env();
        env_map.insert("INTAKE_REPLY_DEADLINE_MS".to_string(), "2500".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.intake_reply_deadline, Duration::from_millis(2500));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("INTAKE_QUEUE_CAPACITY".to_string(), "0".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "INTAKE_QUEUE_CAPACITY"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_backoff_list() {
        let mut env_map = setup_required_env();
        env_map.insert("RETRY_BACKOFF_MS".to_string(), "10, 20,40".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(
            config.retry_backoff,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn test_invalid_backoff() {
        let mut env_map = setup_required_env();
        env_map.insert("RETRY_BACKOFF_MS".to_string(), "fast".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(k, _)) if k == "RETRY_BACKOFF_MS"
        ));
    }

    #[test]
    fn test_invalid_rounding_mode() {
        let mut env_map = setup_required_env();
        env_map.insert("ROUNDING_MODE".to_string(), "ceiling".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "ROUNDING_MODE"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_rate_schedule_bounds() {
        let mut env_map = setup_required_env();
        env_map.insert("RATE_SCHEDULE".to_string(), "10,2,1".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.rate_schedule_pct[2].to_canonical_string(), "1");

        let mut env_map = setup_required_env();
        env_map.insert("RATE_SCHEDULE".to_string(), "150,2,1".to_string());
        assert!(Config::from_env_map(env_map).is_err());

        let mut env_map = setup_required_env();
        env_map.insert("RATE_SCHEDULE".to_string(), "15,3".to_string());
        assert!(Config::from_env_map(env_map).is_err());
    }

    #[test]
    fn test_blank_webhook_is_unset() {
        let mut env_map = setup_required_env();
        env_map.insert("NOTIFY_WEBHOOK_URL".to_string(), "  ".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert!(config.notify_webhook_url.is_none());
    }
}
