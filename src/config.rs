use std::env;
use std::time::Duration;

/// Runtime configuration, read entirely from the environment.
/// There are no CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub flush_interval: Duration,
    pub log_level: String,
    pub port: String,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "./store".to_string(),
            flush_interval: Duration::from_millis(500),
            log_level: "INFO".to_string(),
            port: "5656".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            db_path: env::var("DB_PATH").unwrap_or(defaults.db_path),
            flush_interval: env::var("FLUSH_INTERVAL")
                .ok()
                .and_then(|v| parse_duration(&v))
                .unwrap_or(defaults.flush_interval),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            port: env::var("PORT").unwrap_or(defaults.port),
            log_file: env::var("LOG_FILE").ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Parses durations of the form "500ms", "2s", "1m" or a bare
/// millisecond count.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(s) = value.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(m) = value.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    value.parse::<u64>().ok().map(Duration::from_millis)
}
