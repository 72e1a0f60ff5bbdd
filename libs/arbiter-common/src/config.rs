// Pipeline configuration, read from the environment with sensible defaults

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub redis_url: String,
    pub languages_path: String,
    /// Question catalog file used by the in-memory backend
    pub questions_path: String,
    pub store_backend: StoreBackend,
    /// Process-wide number of concurrent sandbox sessions
    pub worker_pool_size: usize,
    /// Run-phase limit per test case, enforced inside the sandbox
    pub case_timeout_ms: u64,
    /// Grace on top of the case timeout for image pulls, container start and compilation
    pub sandbox_setup_ms: u64,
    pub pipeline_timeout_ms: u64,
    pub sandbox_retries: u32,
    pub persist_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub include_hidden_in_test_run: bool,
    pub api_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            languages_path: "config/languages.json".to_string(),
            questions_path: "config/questions.json".to_string(),
            store_backend: StoreBackend::Redis,
            worker_pool_size: 4,
            case_timeout_ms: 2000,
            sandbox_setup_ms: 30_000,
            pipeline_timeout_ms: 60_000,
            sandbox_retries: 3,
            persist_retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 5000,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            include_hidden_in_test_run: false,
            api_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: env_or("REDIS_URL", defaults.redis_url),
            languages_path: env_or("LANGUAGES_CONFIG", defaults.languages_path),
            questions_path: env_or("QUESTIONS_FILE", defaults.questions_path),
            store_backend: env_or("STORE_BACKEND", defaults.store_backend),
            worker_pool_size: env_or("WORKER_POOL_SIZE", defaults.worker_pool_size).max(1),
            case_timeout_ms: env_or("CASE_TIMEOUT_MS", defaults.case_timeout_ms),
            sandbox_setup_ms: env_or("SANDBOX_SETUP_MS", defaults.sandbox_setup_ms),
            pipeline_timeout_ms: env_or("PIPELINE_TIMEOUT_MS", defaults.pipeline_timeout_ms),
            sandbox_retries: env_or("SANDBOX_RETRIES", defaults.sandbox_retries),
            persist_retries: env_or("PERSIST_RETRIES", defaults.persist_retries),
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            retry_backoff_max_ms: env_or("RETRY_BACKOFF_MAX_MS", defaults.retry_backoff_max_ms),
            rate_limit_max: env_or("RATE_LIMIT_MAX", defaults.rate_limit_max),
            rate_limit_window_secs: env_or(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
            include_hidden_in_test_run: env_or(
                "INCLUDE_HIDDEN_IN_TEST_RUN",
                defaults.include_hidden_in_test_run,
            ),
            api_addr: env_or("API_ADDR", defaults.api_addr),
        }
    }

    pub fn case_timeout(&self) -> Duration {
        Duration::from_millis(self.case_timeout_ms)
    }

    pub fn sandbox_setup(&self) -> Duration {
        Duration::from_millis(self.sandbox_setup_ms)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.store_backend, StoreBackend::Redis);
        assert_eq!(config.case_timeout(), Duration::from_secs(2));
        assert_eq!(config.sandbox_setup(), Duration::from_secs(30));
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("Memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("ARBITER_TEST_POOL", "not-a-number");
        assert_eq!(env_or("ARBITER_TEST_POOL", 6usize), 6);
        std::env::set_var("ARBITER_TEST_POOL", "8");
        assert_eq!(env_or("ARBITER_TEST_POOL", 6usize), 8);
    }
}
