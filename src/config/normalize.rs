//! Schema-driven normalization
//!
//! A single recursive interpreter walks raw input against a [`SchemaNode`]
//! tree and produces a [`ConfigTree`] that always satisfies the schema.
//! Values failing validation are reported and dropped from the update, so
//! the key keeps its prior value (or stays absent).

use crate::config::group::normalize_group;
use crate::config::schema::{Check, ScalarType, SchemaNode, Shape};
use crate::error::SurokError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

/// Snapshot of environment variables consulted during normalization
#[derive(Debug, Clone, Default)]
pub struct Environ {
    vars: HashMap<String, String>,
}

impl Environ {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.vars.remove(key);
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

/// Handler run on a value before it is accepted; false rejects the value
pub type SideEffectFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Side-effect handlers keyed by the symbolic name used in schemas
#[derive(Clone, Default)]
pub struct SideEffects {
    handlers: HashMap<String, SideEffectFn>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: SideEffectFn) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Run the named handler; unknown handlers never accept a value
    pub fn invoke(&self, name: &str, value: &Value) -> bool {
        match self.handlers.get(name) {
            Some(handler) => handler(value),
            None => {
                error!("Side effect handler \"{}\" is not defined", name);
                false
            }
        }
    }
}

impl std::fmt::Debug for SideEffects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffects")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Normalized configuration tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigTree(Map<String, Value>);

impl ConfigTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Look up a nested key
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Look up a nested key, falling back to `default`
    pub fn get_or(&self, path: &[&str], default: Value) -> Value {
        self.get(path).cloned().unwrap_or(default)
    }

    /// Set a nested key without schema validation, creating parents as needed
    pub fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.0;
        for key in parents {
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    pub fn remove(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut current = &mut self.0;
        for key in parents {
            current = current.get_mut(*key)?.as_object_mut()?;
        }
        current.remove(*last)
    }

    /// SHA-1 digest over the key-sorted JSON serialization
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(&self.0).unwrap_or_default();
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_default()
    }
}

/// Result of one normalization pass
#[derive(Debug, Default)]
pub struct Normalized {
    pub tree: ConfigTree,
    pub issues: Vec<SurokError>,
}

/// Recursive schema interpreter
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    env: Environ,
    effects: SideEffects,
}

impl Normalizer {
    pub fn new(env: Environ, effects: SideEffects) -> Self {
        Self { env, effects }
    }

    pub fn env(&self) -> &Environ {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environ {
        &mut self.env
    }

    /// Build the environment-augmented default tree of an object schema
    pub fn default_tree(&self, root: &SchemaNode) -> ConfigTree {
        match &root.shape {
            Shape::Object(children) => ConfigTree(self.defaults_of(children)),
            _ => ConfigTree::new(),
        }
    }

    fn defaults_of(&self, children: &BTreeMap<String, SchemaNode>) -> Map<String, Value> {
        let mut conf = Map::new();
        for (key, node) in children {
            if let Shape::Object(grandchildren) = &node.shape {
                conf.insert(key.clone(), Value::Object(self.defaults_of(grandchildren)));
                continue;
            }
            let mut value = node.default.clone();
            let mut issues = Vec::new();
            if let Some(overridden) = self.env_value(node, key, &mut issues) {
                if let Some(checked) = self.normalize_value(node, key, None, &overridden, &mut issues)
                {
                    value = Some(checked);
                }
            }
            if let Some(value) = value {
                conf.insert(key.clone(), value);
            }
        }
        conf
    }

    /// Normalize `input` against `root`, starting from `prior` or the default tree
    pub fn normalize(
        &self,
        root: &SchemaNode,
        prior: Option<&ConfigTree>,
        input: &Value,
    ) -> Normalized {
        let mut issues = Vec::new();
        let base = match prior {
            Some(tree) => tree.clone(),
            None => self.default_tree(root),
        };
        let tree = match (&root.shape, input) {
            (Shape::Object(children), Value::Object(input)) => {
                ConfigTree(self.normalize_object(children, Some(base.as_map()), input, "", &mut issues))
            }
            (_, Value::Null) => base,
            _ => {
                let issue = SurokError::validation("<root>", "configuration must be an object");
                error!("{}", issue);
                issues.push(issue);
                base
            }
        };
        Normalized { tree, issues }
    }

    fn normalize_object(
        &self,
        children: &BTreeMap<String, SchemaNode>,
        prior: Option<&Map<String, Value>>,
        input: &Map<String, Value>,
        parent: &str,
        issues: &mut Vec<SurokError>,
    ) -> Map<String, Value> {
        let mut conf = prior.cloned().unwrap_or_default();
        for (key, value) in input {
            let path = join_key(parent, key);
            let Some(node) = children.get(key) else {
                let issue = SurokError::validation(&path, "unknown parameter");
                error!("{}", issue);
                issues.push(issue);
                continue;
            };
            let mut value = value.clone();
            if let Some(overridden) = self.env_value(node, &path, issues) {
                value = overridden;
            }
            let prior_value = conf.get(key).cloned();
            if let Some(result) =
                self.normalize_value(node, &path, prior_value.as_ref(), &value, issues)
            {
                conf.insert(key.clone(), result);
            }
        }
        conf
    }

    /// Environment override for a node, coerced to the node's scalar type
    fn env_value(
        &self,
        node: &SchemaNode,
        path: &str,
        issues: &mut Vec<SurokError>,
    ) -> Option<Value> {
        let name = node.env_override.as_deref()?;
        let raw = self.env.get(name).filter(|raw| !raw.is_empty())?;
        let scalar = node.scalar_type()?;
        match scalar.coerce(raw) {
            Some(value) => Some(value),
            None => {
                let issue = SurokError::validation(
                    path,
                    format!("environment {}=\"{}\" is not a {}", name, raw, scalar.name()),
                );
                warn!("{}", issue);
                issues.push(issue);
                None
            }
        }
    }

    fn normalize_value(
        &self,
        node: &SchemaNode,
        path: &str,
        prior: Option<&Value>,
        input: &Value,
        issues: &mut Vec<SurokError>,
    ) -> Option<Value> {
        let result = match &node.shape {
            Shape::Scalar(scalar) => as_items(input)
                .into_iter()
                .filter_map(|item| self.check_scalar(node, *scalar, path, item, issues))
                .last(),
            Shape::List(scalar) => Some(Value::Array(
                as_items(input)
                    .into_iter()
                    .filter_map(|item| self.check_scalar(node, *scalar, path, item, issues))
                    .collect(),
            )),
            Shape::Object(children) => match input {
                Value::Object(map) => Some(Value::Object(self.normalize_object(
                    children,
                    prior.and_then(Value::as_object),
                    map,
                    path,
                    issues,
                ))),
                other => {
                    report_type(path, "object", other, issues);
                    None
                }
            },
            Shape::ObjectList(children) => Some(Value::Array(
                as_items(input)
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Object(map) => Some(Value::Object(
                            self.normalize_object(children, None, map, path, issues),
                        )),
                        other => {
                            report_type(path, "object", other, issues);
                            None
                        }
                    })
                    .collect(),
            )),
            Shape::AnyKeys(child) => match input {
                Value::Object(map) => {
                    let mut result = Map::new();
                    for (key, value) in map {
                        let child_path = join_key(path, key);
                        if let Some(value) =
                            self.normalize_value(child, &child_path, None, value, issues)
                        {
                            result.insert(key.clone(), value);
                        }
                    }
                    Some(Value::Object(result))
                }
                other => {
                    let issue = SurokError::validation(
                        path,
                        format!("must be an object, got {}", type_name(other)),
                    );
                    warn!("{}", issue);
                    issues.push(issue);
                    None
                }
            },
        }?;

        if let Some(handler) = &node.side_effect {
            if !self.effects.invoke(handler, &result) {
                let issue = SurokError::validation(
                    path,
                    format!("value {} rejected by {}", result, handler),
                );
                warn!("{}", issue);
                issues.push(issue);
                return None;
            }
        }
        Some(result)
    }

    fn check_scalar(
        &self,
        node: &SchemaNode,
        scalar: ScalarType,
        path: &str,
        value: &Value,
        issues: &mut Vec<SurokError>,
    ) -> Option<Value> {
        if !scalar.matches(value) {
            report_type(path, scalar.name(), value, issues);
            return None;
        }
        let mut value = value.clone();
        for check in &node.checks {
            let failure = match check {
                Check::AllowedValues(allowed) if !allowed.contains(&value) => {
                    Some(format!("value {} is not one of {:?}", value, allowed))
                }
                Check::Directory => match value.as_str() {
                    Some(dir) if !Path::new(dir).is_dir() => {
                        Some(format!("directory \"{}\" not present", dir))
                    }
                    _ => None,
                },
                Check::File => match value.as_str() {
                    Some(file) if !Path::new(file).is_file() => {
                        Some(format!("file \"{}\" not present", file))
                    }
                    _ => None,
                },
                Check::NonNegative => match value.as_i64() {
                    Some(n) if n < 0 => Some(format!("value {} is negative", n)),
                    _ => None,
                },
                Check::GroupPath => {
                    if let Some(group) = value.as_str() {
                        value = Value::String(normalize_group(group));
                    }
                    None
                }
                _ => None,
            };
            if let Some(reason) = failure {
                let issue = SurokError::validation(path, reason);
                error!("{}", issue);
                issues.push(issue);
                return None;
            }
        }
        Some(value)
    }
}

fn as_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn report_type(path: &str, expected: &str, value: &Value, issues: &mut Vec<SurokError>) {
    let issue = SurokError::validation(
        path,
        format!("must be {}, got {} {}", expected, type_name(value), value),
    );
    error!("{}", issue);
    issues.push(issue);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaNode {
        SchemaNode::object([
            ("wait_time", SchemaNode::integer().default_value(20)),
            (
                "version",
                SchemaNode::string().default_value("0.7").allowed(["0.7", "0.8"]),
            ),
            (
                "mesos",
                SchemaNode::object([
                    (
                        "domain",
                        SchemaNode::string()
                            .default_value("marathon.mesos")
                            .env("SUROK_MESOS_DOMAIN"),
                    ),
                    ("enabled", SchemaNode::boolean().default_value(false)),
                ]),
            ),
            ("hosts", SchemaNode::list(ScalarType::String)),
            ("files", SchemaNode::any_keys(SchemaNode::string()).default_value(json!({}))),
            (
                "services",
                SchemaNode::object_list([
                    ("name", SchemaNode::string()),
                    ("group", SchemaNode::string().group_path()),
                ])
                .default_value(json!([])),
            ),
            ("loglevel", SchemaNode::string().default_value("info").side_effect("level")),
        ])
    }

    fn normalizer(env: &[(&str, &str)]) -> Normalizer {
        let mut effects = SideEffects::new();
        effects.register(
            "level",
            Arc::new(|value| matches!(value.as_str(), Some("debug" | "info"))),
        );
        Normalizer::new(Environ::from_pairs(env.iter().copied()), effects)
    }

    #[test]
    fn test_default_tree() {
        let tree = normalizer(&[]).default_tree(&schema());
        assert_eq!(tree.get(&["wait_time"]), Some(&json!(20)));
        assert_eq!(tree.get(&["mesos", "domain"]), Some(&json!("marathon.mesos")));
        assert_eq!(tree.get(&["services"]), Some(&json!([])));
        assert!(tree.get(&["hosts"]).is_none());
    }

    #[test]
    fn test_env_augments_default_tree() {
        let tree = normalizer(&[("SUROK_MESOS_DOMAIN", "dc1.mesos")]).default_tree(&schema());
        assert_eq!(tree.get(&["mesos", "domain"]), Some(&json!("dc1.mesos")));
    }

    #[test]
    fn test_invalid_values_fall_back_to_prior() {
        let normalizer = normalizer(&[]);
        let result = normalizer.normalize(
            &schema(),
            None,
            &json!({"wait_time": "10", "version": "0.9", "unknown": 1}),
        );
        assert_eq!(result.tree.get(&["wait_time"]), Some(&json!(20)));
        assert_eq!(result.tree.get(&["version"]), Some(&json!("0.7")));
        assert!(result.tree.get(&["unknown"]).is_none());
        assert_eq!(result.issues.len(), 3);
    }

    #[test]
    fn test_object_merges_into_prior() {
        let normalizer = normalizer(&[]);
        let result = normalizer.normalize(&schema(), None, &json!({"mesos": {"enabled": true}}));
        assert_eq!(result.tree.get(&["mesos", "enabled"]), Some(&json!(true)));
        assert_eq!(
            result.tree.get(&["mesos", "domain"]),
            Some(&json!("marathon.mesos"))
        );
    }

    #[test]
    fn test_env_supersedes_input_only_when_non_empty() {
        let set = normalizer(&[("SUROK_MESOS_DOMAIN", "env.mesos")]);
        let result = set.normalize(&schema(), None, &json!({"mesos": {"domain": "file.mesos"}}));
        assert_eq!(result.tree.get(&["mesos", "domain"]), Some(&json!("env.mesos")));

        let empty = normalizer(&[("SUROK_MESOS_DOMAIN", "")]);
        let result = empty.normalize(&schema(), None, &json!({"mesos": {"domain": "file.mesos"}}));
        assert_eq!(result.tree.get(&["mesos", "domain"]), Some(&json!("file.mesos")));
    }

    #[test]
    fn test_list_wraps_scalars_and_drops_bad_items() {
        let normalizer = normalizer(&[]);
        let result = normalizer.normalize(&schema(), None, &json!({"hosts": "localhost:11211"}));
        assert_eq!(result.tree.get(&["hosts"]), Some(&json!(["localhost:11211"])));

        let result = normalizer.normalize(&schema(), None, &json!({"hosts": ["a:1", 2, "b:2"]}));
        assert_eq!(result.tree.get(&["hosts"]), Some(&json!(["a:1", "b:2"])));
        assert_eq!(result.issues.len(), 1);
    }

    #[test]
    fn test_any_keys_and_object_list() {
        let normalizer = normalizer(&[]);
        let result = normalizer.normalize(
            &schema(),
            None,
            &json!({
                "files": {"/tmp/a": "x", "/tmp/b": 1},
                "services": [{"name": "web", "group": "xxx.yyy"}, "bad"]
            }),
        );
        assert_eq!(result.tree.get(&["files"]), Some(&json!({"/tmp/a": "x"})));
        assert_eq!(
            result.tree.get(&["services"]),
            Some(&json!([{"name": "web", "group": "/yyy/xxx/"}]))
        );
    }

    #[test]
    fn test_side_effect_rejection_keeps_prior() {
        let normalizer = normalizer(&[]);
        let result = normalizer.normalize(&schema(), None, &json!({"loglevel": "debug"}));
        assert_eq!(result.tree.get(&["loglevel"]), Some(&json!("debug")));
        let result = normalizer.normalize(&schema(), Some(&result.tree), &json!({"loglevel": "loud"}));
        assert_eq!(result.tree.get(&["loglevel"]), Some(&json!("debug")));
    }

    /// Inputs mixing valid values, wrong types, bad list items and unknown keys
    fn generated_inputs() -> Vec<Value> {
        let wait_time = [json!(5), json!("10"), json!(-1), json!(0.5), Value::Null];
        let version = [json!("0.8"), json!("0.9"), json!(7)];
        let mesos = [
            json!({"enabled": true}),
            json!({"domain": "dc1.mesos", "enabled": "yes"}),
            json!("mesos"),
            json!({}),
        ];
        let hosts = [
            json!("a:1"),
            json!(["a:1", false, "b:2"]),
            json!([]),
            json!({"a": 1}),
        ];
        let files = [
            json!({"/tmp/a": "x", "/tmp/b": 1}),
            json!({}),
            json!(["/tmp/c"]),
        ];
        let services = [
            json!([{"name": "web", "group": "a.b*"}, "bad", {"name": 1}]),
            json!([{"group": "/abs/"}]),
            json!({"name": "single", "group": "xxx.yyy"}),
            json!([]),
        ];
        let loglevel = [json!("debug"), json!("loud"), json!(true)];

        (0..48)
            .map(|i: usize| {
                let mut input = serde_json::Map::new();
                input.insert("wait_time".into(), wait_time[i % wait_time.len()].clone());
                input.insert("version".into(), version[(i / 2) % version.len()].clone());
                input.insert("mesos".into(), mesos[(i / 3) % mesos.len()].clone());
                input.insert("hosts".into(), hosts[(i * 7) % hosts.len()].clone());
                input.insert("files".into(), files[(i / 5) % files.len()].clone());
                input.insert("services".into(), services[(i * 5 + 1) % services.len()].clone());
                input.insert("loglevel".into(), loglevel[(i / 4) % loglevel.len()].clone());
                if i % 6 == 0 {
                    input.insert("unknown".into(), json!(i));
                }
                Value::Object(input)
            })
            .collect()
    }

    #[test]
    fn test_normalized_output_satisfies_schema() {
        for env in [&[][..], &[("SUROK_MESOS_DOMAIN", "env.mesos")][..]] {
            let normalizer = normalizer(env);
            for input in generated_inputs() {
                let once = normalizer.normalize(&schema(), None, &input).tree;
                let again = normalizer.normalize(&schema(), None, &once.to_value());
                assert!(again.issues.is_empty(), "{} left issues {:?}", input, again.issues);
                assert_eq!(again.tree, once, "{} did not normalize stably", input);
            }
        }
    }

    #[test]
    fn test_tree_accessors_and_hash() {
        let mut tree = ConfigTree::new();
        tree.set(&["marathon", "enabled"], json!(true));
        assert_eq!(tree.get(&["marathon", "enabled"]), Some(&json!(true)));
        assert_eq!(tree.get_or(&["marathon", "host"], json!("none")), json!("none"));

        let mut other = ConfigTree::new();
        other.set(&["marathon", "enabled"], json!(true));
        assert_eq!(tree.hash(), other.hash());
        other.set(&["wait_time"], json!(1));
        assert_ne!(tree.hash(), other.hash());
        assert_eq!(other.remove(&["wait_time"]), Some(json!(1)));
        assert_eq!(tree.hash(), other.hash());
    }
}
