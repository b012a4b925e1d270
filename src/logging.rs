//! Logging setup
//!
//! Installs the tracing subscriber behind a reloadable filter so the
//! `loglevel` configuration key can change the threshold while running.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::normalize::{SideEffectFn, SideEffects};

/// Name of the side-effect handler bound to the `loglevel` key
pub const SET_LOG_LEVEL: &str = "set_log_level";

/// Levels accepted by the `loglevel` key
pub const LOG_LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];

/// Map a configured level name onto a tracing filter directive
pub fn filter_directive(level: &str) -> Option<&'static str> {
    match level {
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// Handle for changing the active log threshold
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    pub fn set_level(&self, level: &str) -> bool {
        let Some(directive) = filter_directive(level) else {
            return false;
        };
        self.inner.reload(EnvFilter::new(directive)).is_ok()
    }
}

/// Install the global subscriber with the given starting level
pub fn init(level: &str) -> Result<LogLevelHandle> {
    let directive = filter_directive(level).unwrap_or("info");
    let (filter, inner) = reload::Layer::new(EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(LogLevelHandle { inner })
}

/// Built-in side-effect table; `handle` is absent when no subscriber was installed
pub fn side_effects(handle: Option<LogLevelHandle>) -> SideEffects {
    let mut effects = SideEffects::new();
    let handler: SideEffectFn = Arc::new(move |value| {
        let Some(level) = value.as_str() else {
            return false;
        };
        if filter_directive(level).is_none() {
            return false;
        }
        match &handle {
            Some(handle) => handle.set_level(level),
            None => true,
        }
    });
    effects.register(SET_LOG_LEVEL, handler);
    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("warning"), Some("warn"));
        assert_eq!(filter_directive("debug"), Some("debug"));
        assert_eq!(filter_directive("warn"), None);
        assert_eq!(filter_directive("DEBUG"), None);
        for level in LOG_LEVELS {
            assert!(filter_directive(level).is_some());
        }
    }

    #[test]
    fn test_side_effect_validates_level() {
        let effects = side_effects(None);
        assert!(effects.invoke(SET_LOG_LEVEL, &json!("error")));
        assert!(!effects.invoke(SET_LOG_LEVEL, &json!("errrr")));
        assert!(!effects.invoke(SET_LOG_LEVEL, &json!(1)));
        assert!(!effects.invoke("unknown_handler", &json!("info")));
    }
}
