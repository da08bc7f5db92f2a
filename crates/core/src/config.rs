use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub router: RouterConfig,
    pub providers: ProvidersConfig,
    pub logging: LoggingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            allowed_origins: vec!["*".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared credential expected in `X-API-Key`.
    pub api_key: Option<Secret<String>>,
    /// Credential granting the admin role (audit access).
    pub admin_api_key: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QuotaConfig {
    pub requests_per_minute: u32,
    pub window_secs: u64,
    pub daily_token_limit: u64,
    /// Length of the token budget window.
    pub budget_window_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            window_secs: 60,
            daily_token_limit: 100_000,
            budget_window_secs: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub default_model: String,
    pub attempt_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-4".into(),
            attempt_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
            retry_delay_ms: 0,
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub azure: AzureProviderConfig,
    pub openai: RigProviderConfig,
    pub anthropic: RigProviderConfig,
}

/// OpenAI-compatible HTTP endpoint (Azure OpenAI deployments and friends).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AzureProviderConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<Secret<String>>,
    pub deployment: String,
    pub api_version: String,
}

impl Default for AzureProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            deployment: "gpt-4".into(),
            api_version: "2024-02-15-preview".into(),
        }
    }
}

/// Provider reached through Rig; keys come from the provider's usual env var.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RigProviderConfig {
    pub enabled: bool,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSON lines file. Audit goes to the log stream only when unset.
    pub file_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("HUB_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map HUB__QUOTA__DAILY_TOKEN_LIMIT=5000 to quota.daily_token_limit
            .add_source(
                Environment::with_prefix("HUB")
                    .separator("__")
                    .try_parsing(true),
            )
            // Flat variable names used by existing deployments
            .set_override_option("auth.api_key", std::env::var("API_KEY").ok())?
            .set_override_option(
                "quota.requests_per_minute",
                std::env::var("RATE_LIMIT_PER_MINUTE").ok(),
            )?
            .set_override_option(
                "quota.daily_token_limit",
                std::env::var("TOKEN_BUDGET_DAILY").ok(),
            )?
            .set_override_option("logging.level", std::env::var("LOG_LEVEL").ok())?
            .build()?;

        s.try_deserialize()
    }
}
