//! Runtime configuration, sourced from the environment.

use crate::protocol::PermissionMode;
use std::path::PathBuf;
use std::time::Duration;

/// Which Agent Driver implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Child process speaking NDJSON over stdio.
    Process,
    /// In-process driver calling the model API directly.
    Inproc,
}

/// Auto-deny deadlines per permission-prompt kind, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionTimeouts {
    pub tool_use: u64,
    pub plan_approval: u64,
    pub question: u64,
}

impl Default for PermissionTimeouts {
    fn default() -> Self {
        Self {
            tool_use: 60,
            plan_approval: 300,
            question: 60,
        }
    }
}

impl PermissionTimeouts {
    /// Parse the `tool,plan,question` comma triple. Malformed input falls
    /// back to the defaults.
    fn parse(s: &str) -> Self {
        let parts: Vec<u64> = s
            .split(',')
            .map(str::trim)
            .filter_map(|p| p.parse().ok())
            .collect();
        match parts.as_slice() {
            [tool, plan, question] => Self {
                tool_use: *tool,
                plan_approval: *plan,
                question: *question,
            },
            _ => Self::default(),
        }
    }
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub driver: DriverKind,
    /// Command line for the process driver's backend.
    pub agent_command: String,
    pub project_path: PathBuf,
    pub default_permission_mode: PermissionMode,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub ping_miss_limit: u32,
    pub idle_limit: Duration,
    pub idle_grace: Duration,
    pub resume_window: Duration,
    pub screenshot_ttl: Duration,
    pub permission_timeouts: PermissionTimeouts,
    /// Whether `clear_session` also purges the stored message log.
    pub clear_session_purges_messages: bool,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let project_path = env_var("PROJECT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
            });

        Self {
            bind_host: env_var("BIND_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env_parse("PORT").unwrap_or(3456),
            driver: match env_var("DRIVER").as_deref() {
                Some("inproc") => DriverKind::Inproc,
                _ => DriverKind::Process,
            },
            agent_command: env_var("AGENT_COMMAND")
                .unwrap_or_else(|| "agent-backend".to_string()),
            project_path,
            default_permission_mode: env_var("DEFAULT_PERMISSION_MODE")
                .as_deref()
                .and_then(PermissionMode::parse)
                .unwrap_or(PermissionMode::Plan),
            max_connections: env_parse("MAX_CONNECTIONS").unwrap_or(100),
            ping_interval: Duration::from_secs(env_parse("PING_INTERVAL_SECONDS").unwrap_or(30)),
            ping_miss_limit: env_parse("PING_MISS_LIMIT").unwrap_or(2),
            idle_limit: Duration::from_secs(60 * env_parse("IDLE_LIMIT_MINUTES").unwrap_or(30)),
            idle_grace: Duration::from_secs(60 * env_parse("IDLE_GRACE_MINUTES").unwrap_or(30)),
            resume_window: Duration::from_secs(
                3600 * env_parse("RESUME_WINDOW_HOURS").unwrap_or(24),
            ),
            screenshot_ttl: Duration::from_secs(
                3600 * env_parse("SCREENSHOT_TTL_HOURS").unwrap_or(24),
            ),
            permission_timeouts: env_var("PERMISSION_DEFAULT_TIMEOUTS")
                .as_deref()
                .map(PermissionTimeouts::parse)
                .unwrap_or_default(),
            clear_session_purges_messages: env_bool("CLEAR_SESSION_PURGES_MESSAGES"),
            debug: env_bool("DEBUG"),
        }
    }

    /// Project-scoped directory holding the store file, screenshots, and logs.
    pub fn data_dir(&self) -> PathBuf {
        self.project_path.join(".tabbridge")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("tabbridge.db")
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.data_dir().join("screenshots")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_var(name).as_deref(),
        Some("1" | "true" | "TRUE" | "yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_timeouts_parse_triple() {
        let t = PermissionTimeouts::parse("30,600,45");
        assert_eq!(t.tool_use, 30);
        assert_eq!(t.plan_approval, 600);
        assert_eq!(t.question, 45);
    }

    #[test]
    fn permission_timeouts_malformed_falls_back() {
        assert_eq!(PermissionTimeouts::parse("30"), PermissionTimeouts::default());
        assert_eq!(
            PermissionTimeouts::parse("a,b,c"),
            PermissionTimeouts::default()
        );
        assert_eq!(PermissionTimeouts::parse(""), PermissionTimeouts::default());
    }

    #[test]
    fn data_dir_is_project_scoped() {
        let config = Config {
            bind_host: "127.0.0.1".to_string(),
            port: 3456,
            driver: DriverKind::Process,
            agent_command: "agent-backend".to_string(),
            project_path: PathBuf::from("/proj"),
            default_permission_mode: PermissionMode::Plan,
            max_connections: 100,
            ping_interval: Duration::from_secs(30),
            ping_miss_limit: 2,
            idle_limit: Duration::from_secs(1800),
            idle_grace: Duration::from_secs(1800),
            resume_window: Duration::from_secs(86_400),
            screenshot_ttl: Duration::from_secs(86_400),
            permission_timeouts: PermissionTimeouts::default(),
            clear_session_purges_messages: false,
            debug: false,
        };
        assert_eq!(config.db_path(), PathBuf::from("/proj/.tabbridge/tabbridge.db"));
        assert_eq!(
            config.screenshots_dir(),
            PathBuf::from("/proj/.tabbridge/screenshots")
        );
    }
}
