//! Tracing subscriber setup for hosts that do not install their own

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown log format: {other}")),
        }
    }
}

/// Filter from `RUST_LOG`, defaulting to `info`
fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global `fmt` subscriber
///
/// Uses `try_init`, so a subscriber installed earlier (by the host or a
/// previous call) is left in place.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::fmt;

    let filter = build_env_filter();
    let result = match format {
        LogFormat::Json => fmt::fmt().with_env_filter(filter).json().with_target(true).try_init(),
        LogFormat::Pretty => fmt::fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    drop(result);
}
