//! Command-line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::retry::RetryConfig;

/// Companion - session core for agent conversations
#[derive(Parser, Debug, Clone)]
#[command(name = "companion", version)]
pub struct Args {
    /// Address the renderer-facing server binds to
    #[arg(long, env = "COMPANION_BIND", default_value = "127.0.0.1:4100")]
    pub bind: SocketAddr,

    /// Base URL of the agent host
    #[arg(long, env = "COMPANION_AGENT_URL", default_value = "http://127.0.0.1:3456")]
    pub agent_url: String,

    /// Data directory (logs); defaults to ~/.companion
    #[arg(long, env = "COMPANION_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Transport open attempts before giving up
    #[arg(long, default_value_t = 50)]
    pub connect_attempts: u32,

    /// First backoff delay between transport attempts
    #[arg(long, default_value_t = 200)]
    pub connect_base_delay_ms: u64,

    /// Backoff ceiling between transport attempts
    #[arg(long, default_value_t = 5_000)]
    pub connect_max_delay_ms: u64,

    /// How often to ask the agent host whether the remote process is alive
    #[arg(long, default_value_t = 5_000)]
    pub probe_interval_ms: u64,

    /// Stay disconnected after an unexpected transport loss
    #[arg(long)]
    pub no_auto_reconnect: bool,
}

/// Connection supervision settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub retry: RetryConfig,
    pub probe_interval: Duration,
    pub auto_reconnect: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            probe_interval: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }
}

impl Args {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let base_delay = Duration::from_millis(self.connect_base_delay_ms);
        SupervisorConfig {
            retry: RetryConfig {
                max_attempts: self.connect_attempts.max(1),
                base_delay,
                max_delay: Duration::from_millis(self.connect_max_delay_ms).max(base_delay),
                ..RetryConfig::default()
            },
            probe_interval: Duration::from_millis(self.probe_interval_ms.max(100)),
            auto_reconnect: !self.no_auto_reconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_supervisor_config() {
        let args = Args::try_parse_from([
            "companion",
            "--bind",
            "0.0.0.0:9000",
            "--agent-url",
            "http://agent:1234",
            "--connect-attempts",
            "0",
            "--connect-base-delay-ms",
            "500",
            "--connect-max-delay-ms",
            "100",
            "--no-auto-reconnect",
        ])
        .expect("parse");

        assert_eq!(args.bind.port(), 9000);
        assert_eq!(args.agent_url, "http://agent:1234");

        let config = args.supervisor_config();
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.max_delay, Duration::from_millis(500));
        assert!(!config.auto_reconnect);
    }

    #[test]
    fn defaults_reconnect_automatically() {
        let args = Args::try_parse_from(["companion"]).expect("parse");
        let config = args.supervisor_config();
        assert!(config.auto_reconnect);
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 50);
    }
}
