use std::env;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub cache_url: String,
    pub openai: OpenAiConfig,
    pub classify: ClassifyConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Provider HTTP client timeout, seconds.
    pub request_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    /// When false the classifier returns dummy results without calling the provider.
    pub enabled: bool,
    pub rate_limit_per_minute: u32,
}

fn get_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(Self {
            server: ServerConfig {
                host: get_str("SERVER_HOST", "127.0.0.1"),
                port: get_parsed("SERVER_PORT", 8080),
            },
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?,
            cache_url: get_str("CACHE_URL", "redis://127.0.0.1:6379"),
            openai: OpenAiConfig {
                api_key: get_str("OPENAI_API_KEY", ""),
                base_url: get_str("OPENAI_BASE_URL", "https://api.openai.com/v1"),
                model: get_str("OPENAI_MODEL", "gpt-3.5-turbo"),
                request_timeout: get_parsed("OPENAI_REQUEST_TIMEOUT", 30),
            },
            classify: ClassifyConfig {
                enabled: get_bool("CLASSIFY_ENABLED", true),
                rate_limit_per_minute: get_parsed("RATE_LIMIT_PER_MINUTE", 10),
            },
        })
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("server", &self.server)
            .field("database_url", &"[REDACTED]")
            .field("cache_url", &self.cache_url)
            .field("openai", &self.openai)
            .field("classify", &self.classify)
            .finish()
    }
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_forms() {
        env::set_var("TEST_CLASSIFY_FLAG", "TRUE");
        assert!(get_bool("TEST_CLASSIFY_FLAG", false));
        env::set_var("TEST_CLASSIFY_FLAG", "0");
        assert!(!get_bool("TEST_CLASSIFY_FLAG", true));
        env::remove_var("TEST_CLASSIFY_FLAG");
        assert!(get_bool("TEST_CLASSIFY_FLAG", true));
    }

    #[test]
    fn parsed_values_fall_back_to_defaults() {
        env::set_var("TEST_RATE_LIMIT", "not a number");
        assert_eq!(get_parsed("TEST_RATE_LIMIT", 10u32), 10);
        env::set_var("TEST_RATE_LIMIT", "25");
        assert_eq!(get_parsed("TEST_RATE_LIMIT", 10u32), 25);
        env::remove_var("TEST_RATE_LIMIT");
    }
}
