use crate::telemetry::logging::{LogConfig, LogLevel};
use clap::{Args, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tidepool",
    version,
    about = "Serve interactive shell sessions to web terminals over WebSocket"
)]
pub struct Cli {
    #[arg(long, env = "TIDEPOOL_HOST", help = "Address to bind the HTTP listener to")]
    pub host: Option<String>,

    #[arg(long, env = "TIDEPOOL_PORT", help = "Port to bind the HTTP listener to")]
    pub port: Option<u16>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TIDEPOOL_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TIDEPOOL_LOG_FILE",
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
