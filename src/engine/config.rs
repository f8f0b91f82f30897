use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub bind_addr: SocketAddr,
    pub workspace_root: PathBuf,
    pub run_timeout: Duration,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub conflict_policy: ConflictPolicy,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let workspace_root = env::var("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_workspace_root());
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            workspace_root,
            run_timeout: Duration::from_secs(env_parse("RUN_TIMEOUT_SECS", 30u64).max(1)),
            max_code_bytes: env_parse("MAX_CODE_BYTES", 256 * 1024usize),
            max_input_bytes: env_parse("MAX_INPUT_BYTES", 64 * 1024usize),
            conflict_policy: env_parse("CONFLICT_POLICY", ConflictPolicy::Supersede),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env_parse("LOG_FORMAT", LogFormat::Json),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            workspace_root: default_workspace_root(),
            run_timeout: Duration::from_secs(30),
            max_code_bytes: 256 * 1024,
            max_input_bytes: 64 * 1024,
            conflict_policy: ConflictPolicy::Supersede,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// What `run` does when the client already has a live session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Terminate the previous process and start the new one.
    #[default]
    Supersede,
    /// Refuse the new run until the previous one ends.
    Reject,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "supersede" => Ok(Self::Supersede),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("unsupported conflict policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported log format: {s}")),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| env::temp_dir())
        .join("temp")
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
