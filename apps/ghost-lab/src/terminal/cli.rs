use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "ghost-lab",
    about = "👻 Share a live terminal, chat and effects over a direct peer link",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "GHOST_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "GHOST_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    #[arg(
        long = "connect-timeout-ms",
        global = true,
        value_name = "MS",
        help = "Give up on an outbound connect after this long (0 waits indefinitely)"
    )]
    pub connect_timeout_ms: Option<u64>,

    #[arg(
        long = "log-capacity",
        global = true,
        value_name = "N",
        help = "Operator log entries to keep"
    )]
    pub log_capacity: Option<usize>,
}

impl SessionArgs {
    /// Layers explicit flags over `base`.
    pub fn apply(&self, mut base: SessionConfig) -> SessionConfig {
        if let Some(ms) = self.connect_timeout_ms {
            base = base.with_connect_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if let Some(capacity) = self.log_capacity {
            base = base.with_log_capacity(capacity);
        }
        base
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a local engine and accept guests
    Host(HostArgs),
    /// Join a host by its identity
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[arg(
        long,
        env = "GHOST_LISTEN",
        default_value = "0.0.0.0:0",
        help = "Address to accept guests on"
    )]
    pub listen: SocketAddr,

    #[arg(
        long,
        env = "GHOST_ADVERTISE",
        value_name = "HOST",
        help = "Host name or IP guests should dial (defaults to the listen address)"
    )]
    pub advertise: Option<String>,

    #[arg(
        long = "no-boot",
        action = clap::ArgAction::SetTrue,
        help = "Do not boot the engine until asked from the console"
    )]
    pub no_boot: bool,

    #[arg(
        trailing_var_arg = true,
        value_name = "COMMAND",
        help = "Command to run instead of $SHELL"
    )]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(value_name = "IDENTITY", help = "Identity printed by the host (token@host:port)")]
    pub target: String,

    #[arg(
        long,
        default_value = "127.0.0.1:0",
        help = "Local address for this session's own identity"
    )]
    pub listen: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_accepts_trailing_command() {
        let cli = Cli::try_parse_from([
            "ghost-lab", "host", "--listen", "127.0.0.1:7000", "--no-boot", "--", "bash", "-l",
        ])
        .unwrap();
        let Command::Host(args) = cli.command else {
            panic!("expected host");
        };
        assert_eq!(args.listen, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert!(args.no_boot);
        assert_eq!(args.command, ["bash", "-l"]);
    }

    #[test]
    fn join_requires_identity_and_global_flags_apply() {
        assert!(Cli::try_parse_from(["ghost-lab", "join"]).is_err());
        let cli = Cli::try_parse_from([
            "ghost-lab",
            "join",
            "abc@127.0.0.1:7000",
            "--connect-timeout-ms",
            "0",
            "--log-capacity",
            "30",
        ])
        .unwrap();
        let Command::Join(args) = &cli.command else {
            panic!("expected join");
        };
        assert_eq!(args.target, "abc@127.0.0.1:7000");

        let config = cli.session.apply(SessionConfig::default());
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.log_capacity, 30);
    }

    #[test]
    fn unset_flags_keep_base_config() {
        let base = SessionConfig::default().with_log_capacity(99);
        assert_eq!(SessionArgs::default().apply(base.clone()), base);
    }
}
