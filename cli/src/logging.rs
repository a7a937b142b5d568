//! Tracing initialisation.

use tickmux_core::config::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter directive string, e.g. `"info,tickmux_ws=debug"`.
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn directives(config: &LogConfig) -> String {
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());
    let mut components: Vec<_> = config.components.iter().collect();
    components.sort();
    let mut out = base;
    for (component, level) in components {
        out.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }
    out
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(directives(config)).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
