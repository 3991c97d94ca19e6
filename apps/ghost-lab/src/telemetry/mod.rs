fn env_flag(var: &str) -> Option<bool> {
    std::env::var(var)
        .ok()
        .map(|value| !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false"))
}

pub mod logging {
    use clap::ValueEnum;
    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "GHOST_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "GHOST_TRACE_DEPS";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Log destination; stderr when unset.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Configure(String),
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (filter, throttled) = build_env_filter(config.level.to_filter());
        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled {
            eprintln!(
                "[ghost-lab] dependency traces capped at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(raw) = std::env::var(FILTER_ENV) {
            return (EnvFilter::new(raw), false);
        }
        let allow_deps = super::env_flag(TRACE_DEPS_ENV).unwrap_or(false);
        let (directives, throttled) = default_directives(level, allow_deps);
        (EnvFilter::new(directives), throttled)
    }

    const NOISY_TARGETS: &[&str] = &["mio", "tokio", "runtime", "portable_pty", "filedescriptor"];

    /// Filter directives for `level`. At trace, noisy dependencies are held
    /// at info unless `allow_deps`; the flag reports whether that happened.
    pub(crate) fn default_directives(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let mut directives = match level {
            LevelFilter::TRACE => "info,ghost_lab=trace".to_string(),
            LevelFilter::DEBUG => "info,ghost_lab=debug".to_string(),
            other => other.to_string().to_lowercase(),
        };
        if level != LevelFilter::TRACE || allow_deps {
            return (directives, false);
        }
        for target in NOISY_TARGETS {
            let _ = write!(directives, ",{target}=info");
        }
        (directives, true)
    }

    /// Offset, hex bytes and printable ASCII, 16 bytes per row.
    pub fn hexdump(bytes: &[u8]) -> String {
        let mut out = String::new();
        for (row, chunk) in bytes.chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|byte| format!("{byte:02x}")).collect();
            let ascii: String = chunk
                .iter()
                .map(|&byte| {
                    if byte.is_ascii_graphic() || byte == b' ' {
                        byte as char
                    } else {
                        '.'
                    }
                })
                .collect();
            let _ = writeln!(out, "{:06x}  {:<47}  |{ascii}|", row * 16, hex.join(" "));
        }
        out
    }

}
