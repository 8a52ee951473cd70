use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Settings for the background scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    /// Size of the scheduler's own connection pool, never shared with request handlers.
    pub max_connections: u32,
    pub startup_max_wait: Duration,
    pub shutdown_timeout: Duration,
    pub max_backoff_secs: u64,
    /// How long a timed-out execution may keep running after it was told to stop.
    pub timeout_grace: Duration,
    /// How many pending jobs one tick looks at when filling free slots.
    pub pending_scan_limit: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_concurrent_tasks: 3,
            max_connections: 2,
            startup_max_wait: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_backoff_secs: 60,
            timeout_grace: Duration::from_secs(5),
            pending_scan_limit: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_millis(env_or(
                "JOB_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            max_concurrent_tasks: env_or("JOB_MAX_CONCURRENT_TASKS", defaults.max_concurrent_tasks),
            max_connections: env_or("JOB_SCHEDULER_MAX_CONNECTIONS", defaults.max_connections),
            startup_max_wait: Duration::from_secs(env_or(
                "JOB_STARTUP_MAX_WAIT_SECS",
                defaults.startup_max_wait.as_secs(),
            )),
            shutdown_timeout: Duration::from_secs(env_or(
                "JOB_SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )),
            max_backoff_secs: env_or("JOB_MAX_BACKOFF_SECS", defaults.max_backoff_secs),
            timeout_grace: Duration::from_millis(env_or(
                "JOB_TIMEOUT_GRACE_MS",
                defaults.timeout_grace.as_millis() as u64,
            )),
            pending_scan_limit: env_or("JOB_PENDING_SCAN_LIMIT", defaults.pending_scan_limit),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("JOB_MAX_CONCURRENT_TASKS must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("JOB_POLL_INTERVAL_MS must be greater than 0".to_string());
        }
        if self.max_connections == 0 {
            return Err("JOB_SCHEDULER_MAX_CONNECTIONS must be at least 1".to_string());
        }
        if self.pending_scan_limit <= 0 {
            return Err("JOB_PENDING_SCAN_LIMIT must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_startup_max_wait(mut self, wait: Duration) -> Self {
        self.startup_max_wait = wait;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_backoff_secs(mut self, secs: u64) -> Self {
        self.max_backoff_secs = secs;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub api_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL is not set".to_string())?;
        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| format!("Invalid BIND_ADDR: {}", e))?;

        let config = Self {
            database_url,
            api_max_connections: env_or("API_MAX_CONNECTIONS", 10),
            bind_addr,
            scheduler: SchedulerConfig::from_env(),
        };
        config.scheduler.validate()?;
        Ok(config)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("Ignoring invalid {}={:?}, using the default", key, raw);
            default
        }
    }
}
