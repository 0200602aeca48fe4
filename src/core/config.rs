use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_hostname: String,
    pub api_key: String,
    pub default_model: String,
    pub storage_path: String,
    pub db_path: String,
    pub temperature: Option<f32>,
    pub request_timeout: Duration,
    // Not something the server enforces. A stream that goes quiet for
    // this long is treated as a dropped connection.
    pub idle_timeout: Duration,
}

/// Reads a numeric env var, falling back to `default` when it's unset
/// or doesn't parse.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => val.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {}", key, val);
            default
        }),
        Err(_) => default,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let storage_path = env::var("LMCHAT_STORAGE_PATH").unwrap_or("./".to_string());
        let db_path = format!("{}/lmchat.db", storage_path.trim_end_matches('/'));
        let api_hostname = env::var("LMCHAT_API_HOST")
            .unwrap_or_else(|_| "http://127.0.0.1:1234".to_string());
        let api_key = env::var("LMCHAT_API_KEY").unwrap_or_else(|_| "lm-studio".to_string());
        let default_model = env::var("LMCHAT_MODEL").unwrap_or_default();
        let temperature = Some(env_or("LMCHAT_TEMPERATURE", 0.7_f32));
        let request_timeout =
            Duration::from_secs(env_or("LMCHAT_REQUEST_TIMEOUT_SECS", 60 * 10_u64));
        let idle_timeout = Duration::from_secs(env_or("LMCHAT_IDLE_TIMEOUT_SECS", 120_u64));

        Self {
            api_hostname,
            api_key,
            default_model,
            storage_path,
            db_path,
            temperature,
            request_timeout,
            idle_timeout,
        }
    }
}
