use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Local hardware access broker daemon.
#[derive(Debug, Parser)]
#[command(name = "hwbridge", version, about)]
pub struct Args {
    /// Configuration file path; defaults to the platform config directory.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured listening host.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured listening port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the queue database path.
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Serve scripted fixture adapters instead of real hardware.
    #[arg(long)]
    pub fake: bool,
}

/// Minimum severity written to the log output.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `EnvFilter` directive this level maps to.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_a_plain_run() {
        let args = Args::try_parse_from(["hwbridge"]).expect("bare invocation parses");
        assert_eq!(None, args.config);
        assert_eq!(LogLevel::Info, args.log_level);
        assert!(!args.fake);
    }

    #[test]
    fn overrides_parse() {
        let args = Args::try_parse_from([
            "hwbridge",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--fake",
        ])
        .expect("overrides parse");
        assert_eq!(Some(9000), args.port);
        assert_eq!(LogLevel::Debug, args.log_level);
        assert!(args.fake);
    }
}
