//! Tracing subscriber setup for the daemon.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependencies that are noisy at debug level
const QUIET: &[&str] = &["hyper=info", "tower_http=info", "tungstenite=info"];

fn filter_for(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![level.to_string()];
    directives.extend(QUIET.iter().map(|d| d.to_string()));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// `level` comes from the command line and beats `config.level`; `RUST_LOG`
/// beats both.
pub fn init(config: &LogConfig, level: Option<&str>) -> anyhow::Result<()> {
    let filter = filter_for(level.unwrap_or(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(config.ansi),
        )
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_falls_back() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = filter_for("not a level!!");
        assert_eq!(
            filter.max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::INFO)
        );
    }
}
