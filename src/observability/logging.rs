//! Process-wide log subscriber.
//!
//! Configured from the environment:
//! - `GATEWAY_LOG_LEVEL`: `DEBUG`, `INFO` (default), `WARN`, `ERROR`; `FATAL`
//!   is treated as `ERROR`
//! - `GATEWAY_LOG_LOCATION`: `true` adds file and line to every event
//! - `GATEWAY_LOG_DATETIME`: `false` drops the timestamp
//!
//! `RUST_LOG` takes precedence over `GATEWAY_LOG_LEVEL` when set.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const ENV_LEVEL: &str = "GATEWAY_LOG_LEVEL";
pub const ENV_LOCATION: &str = "GATEWAY_LOG_LOCATION";
pub const ENV_DATETIME: &str = "GATEWAY_LOG_DATETIME";

/// Map a `GATEWAY_LOG_LEVEL` value to a level filter.
pub fn level_from_env(value: Option<&str>) -> LevelFilter {
    match value.map(|v| v.trim().to_ascii_uppercase()).as_deref() {
        Some("TRACE") => LevelFilter::TRACE,
        Some("DEBUG") => LevelFilter::DEBUG,
        Some("WARN") | Some("WARNING") => LevelFilter::WARN,
        Some("ERROR") | Some("FATAL") => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
        _ => default,
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_from_env() -> Result<(), String> {
    let level = level_from_env(std::env::var(ENV_LEVEL).ok().as_deref());
    let location = flag(std::env::var(ENV_LOCATION).ok(), false);
    let datetime = flag(std::env::var(ENV_DATETIME).ok(), true);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let layer = fmt::layer()
        .with_target(true)
        .with_file(location)
        .with_line_number(location);
    let layer = if datetime {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_with_info_default() {
        assert_eq!(level_from_env(None), LevelFilter::INFO);
        assert_eq!(level_from_env(Some("debug")), LevelFilter::DEBUG);
        assert_eq!(level_from_env(Some("FATAL")), LevelFilter::ERROR);
        assert_eq!(level_from_env(Some("nonsense")), LevelFilter::INFO);
    }

    #[test]
    fn flags_fall_back_to_default() {
        assert!(flag(None, true));
        assert!(!flag(Some("false".into()), true));
        assert!(flag(Some("TRUE".into()), false));
        assert!(!flag(Some("maybe".into()), false));
    }
}
