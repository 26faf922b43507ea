/// Per-action rate-limit ceilings and windows.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub messages_free: u64,
    pub messages_badge: u64,
    pub message_window_secs: u64,
    pub pokes: u64,
    pub poke_window_secs: u64,
    pub agent_personal: u64,
    pub agent_personal_window_secs: u64,
    pub agent_global: u64,
    pub agent_global_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_free: 30,
            messages_badge: 60,
            message_window_secs: 3600,
            pokes: 5,
            poke_window_secs: 86_400,
            agent_personal: 2,
            agent_personal_window_secs: 120,
            agent_global: 1,
            agent_global_window_secs: 120,
        }
    }
}

/// Upstream AI completion endpoint. Absent URL disables agent mentions.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Display name agent messages are posted under.
    pub username: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            username: "barista".to_string(),
        }
    }
}

/// Cafe API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. In-memory repository when unset.
    pub database_url: Option<String>,
    /// Redis connection string. In-memory store when unset.
    pub redis_url: Option<String>,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Bearer token guarding the admin routes.
    pub admin_token: String,
    /// Snowflake worker id of this process.
    pub worker_id: u16,
    pub jobs_enabled: bool,
    pub rate_limits: RateLimitConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            port: 4002,
            admin_token: "dev-admin-token".to_string(),
            worker_id: 0,
            jobs_enabled: true,
            rate_limits: RateLimitConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = RateLimitConfig::default();
        let agent_defaults = AgentConfig::default();
        Self {
            database_url: optional_var("DATABASE_URL"),
            redis_url: optional_var("REDIS_URL"),
            port: parsed_var("PORT").unwrap_or(4002),
            admin_token: required_var("ADMIN_TOKEN"),
            worker_id: parsed_var("WORKER_ID").unwrap_or(0),
            jobs_enabled: parsed_var("JOBS_ENABLED").unwrap_or(true),
            rate_limits: RateLimitConfig {
                messages_free: parsed_var("RATE_LIMIT_MESSAGES_FREE").unwrap_or(defaults.messages_free),
                messages_badge: parsed_var("RATE_LIMIT_MESSAGES_BADGE")
                    .unwrap_or(defaults.messages_badge),
                pokes: parsed_var("RATE_LIMIT_POKES").unwrap_or(defaults.pokes),
                ..defaults
            },
            agent: AgentConfig {
                api_url: optional_var("AGENT_API_URL"),
                api_key: optional_var("AGENT_API_KEY"),
                model: optional_var("AGENT_MODEL").unwrap_or(agent_defaults.model),
                username: optional_var("AGENT_USERNAME").unwrap_or(agent_defaults.username),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    optional_var(name).and_then(|v| v.parse().ok())
}
