//! Artifact rendering with minijinja
//!
//! Templates see two globals: `my` (the resolved services, the declaration
//! name, the process environment and a timestamp) and `mod`, a helper object
//! whose methods are the statically registered template helpers.

use crate::error::SurokError;
use minijinja::value::{from_args, Object, Value as JinjaValue};
use minijinja::{Environment, Error, ErrorKind, State, UndefinedBehavior};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Helper methods reachable as `mod.<name>(...)` inside templates
#[derive(Debug, Default)]
pub struct Helpers;

impl Object for Helpers {
    fn call_method(
        self: &Arc<Self>,
        state: &State<'_, '_>,
        method: &str,
        args: &[JinjaValue],
    ) -> Result<JinjaValue, Error> {
        match method {
            "from_file" => {
                let (path,): (String,) = from_args(args)?;
                std::fs::read_to_string(&path)
                    .map(JinjaValue::from)
                    .map_err(|e| {
                        Error::new(
                            ErrorKind::InvalidOperation,
                            format!("cannot read {}: {}", path, e),
                        )
                    })
            }
            "template" => {
                let (source,): (String,) = from_args(args)?;
                let mut ctx = BTreeMap::new();
                ctx.insert("my", state.lookup("my").unwrap_or_default());
                ctx.insert("mod", JinjaValue::from_dyn_object(self.clone()));
                state.env().render_str(&source, ctx).map(JinjaValue::from)
            }
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("mod has no helper named {}", method),
            )),
        }
    }
}

/// Build the `my` context for one declaration
pub fn build_context(services: serde_json::Value, conf_name: &str) -> JinjaValue {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let mut my = BTreeMap::new();
    my.insert("services", JinjaValue::from_serialize(&services));
    my.insert("conf_name", JinjaValue::from(conf_name));
    my.insert("env", JinjaValue::from_serialize(&env));
    my.insert("timestamp", JinjaValue::from(timestamp));
    JinjaValue::from_serialize(&my)
}

/// Strict-undefined renderer shared across cycles
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Render `source` for the artifact `target` with the given `my` context
    pub fn render(&self, target: &str, source: &str, my: &JinjaValue) -> Result<String, SurokError> {
        let mut ctx = BTreeMap::new();
        ctx.insert("my", my.clone());
        ctx.insert("mod", JinjaValue::from_object(Helpers));
        self.env
            .render_str(source, ctx)
            .map_err(|e| SurokError::Render {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }
}
