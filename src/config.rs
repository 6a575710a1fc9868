use std::env;
#[cfg(test)]
use std::sync::Mutex;

/// Tidepool console configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Websocket endpoint of the streaming SQL engine
    pub engine_url: String,
    /// Bearer credential presented during the transport handshake
    pub token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let engine_url = env::var("TIDEPOOL_ENGINE_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:6875/api/sql".to_string());
        let token = env::var("TIDEPOOL_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self { engine_url, token }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_url: "ws://127.0.0.1:6875/api/sql".to_string(),
            token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine_url, "ws://127.0.0.1:6875/api/sql");
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe {
            env::remove_var("TIDEPOOL_ENGINE_URL");
            env::remove_var("TIDEPOOL_TOKEN");
        }
        let config = Config::from_env();
        assert_eq!(config.engine_url, "ws://127.0.0.1:6875/api/sql");
        assert!(config.token.is_none());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original_url = env::var("TIDEPOOL_ENGINE_URL").ok();
        let original_token = env::var("TIDEPOOL_TOKEN").ok();

        unsafe {
            env::set_var("TIDEPOOL_ENGINE_URL", "wss://engine.example.com/api/sql");
            env::set_var("TIDEPOOL_TOKEN", "  secret  ");
        }
        let config = Config::from_env();
        assert_eq!(config.engine_url, "wss://engine.example.com/api/sql");
        assert_eq!(config.token.as_deref(), Some("secret"));

        unsafe {
            match original_url {
                Some(orig) => env::set_var("TIDEPOOL_ENGINE_URL", orig),
                None => env::remove_var("TIDEPOOL_ENGINE_URL"),
            }
            match original_token {
                Some(orig) => env::set_var("TIDEPOOL_TOKEN", orig),
                None => env::remove_var("TIDEPOOL_TOKEN"),
            }
        }
    }

    #[test]
    fn test_blank_token_treated_as_absent() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("TIDEPOOL_TOKEN").ok();
        unsafe {
            env::set_var("TIDEPOOL_TOKEN", "   ");
        }
        let config = Config::from_env();
        assert!(config.token.is_none());

        unsafe {
            match original {
                Some(orig) => env::set_var("TIDEPOOL_TOKEN", orig),
                None => env::remove_var("TIDEPOOL_TOKEN"),
            }
        }
    }
}
