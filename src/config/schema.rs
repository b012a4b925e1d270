//! Declarative schema nodes
//!
//! A schema is a tree of [`SchemaNode`]s. Each node carries its value shape,
//! the checks applied to scalar values, an optional default, an optional
//! environment override and an optional side-effect handler name.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Scalar value types understood by the normalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    String,
    Integer,
    Boolean,
}

impl ScalarType {
    /// Whether a JSON value already has this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ScalarType::String => value.is_string(),
            ScalarType::Integer => value.is_i64() || value.is_u64(),
            ScalarType::Boolean => value.is_boolean(),
        }
    }

    /// Coerce a raw environment string into this type
    pub fn coerce(&self, raw: &str) -> Option<Value> {
        match self {
            ScalarType::String => Some(Value::String(raw.to_string())),
            ScalarType::Integer => raw.trim().parse::<i64>().ok().map(Value::from),
            ScalarType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Integer => "integer",
            ScalarType::Boolean => "boolean",
        }
    }
}

/// Shape of the value a node accepts
#[derive(Debug, Clone)]
pub enum Shape {
    /// A single scalar
    Scalar(ScalarType),
    /// A list of scalars; a bare scalar input is wrapped into a list
    List(ScalarType),
    /// An object with a fixed key set
    Object(BTreeMap<String, SchemaNode>),
    /// A list of objects sharing one fixed key set
    ObjectList(BTreeMap<String, SchemaNode>),
    /// An object with arbitrary keys, every value validated by one child schema
    AnyKeys(Box<SchemaNode>),
}

/// Checks applied to each scalar value after the type check
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    AllowedValues(Vec<Value>),
    Directory,
    File,
    /// Integers must be zero or greater
    NonNegative,
    /// Rewrites dotted identifiers into group paths
    GroupPath,
}

/// Kind flags describing a node, as listed in the configuration docs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    String,
    Integer,
    Boolean,
    Object,
    List,
    AnyKeys,
    HasAllowedValues,
    IsDirectory,
    IsFile,
    IsNonNegative,
    IsGroupPath,
    HasSideEffect,
}

/// Declarative descriptor for one configuration key
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub shape: Shape,
    pub checks: Vec<Check>,
    pub default: Option<Value>,
    pub env_override: Option<String>,
    pub side_effect: Option<String>,
}

impl SchemaNode {
    fn with_shape(shape: Shape) -> Self {
        Self {
            shape,
            checks: Vec::new(),
            default: None,
            env_override: None,
            side_effect: None,
        }
    }

    pub fn string() -> Self {
        Self::with_shape(Shape::Scalar(ScalarType::String))
    }

    pub fn integer() -> Self {
        Self::with_shape(Shape::Scalar(ScalarType::Integer))
    }

    pub fn boolean() -> Self {
        Self::with_shape(Shape::Scalar(ScalarType::Boolean))
    }

    pub fn list(item: ScalarType) -> Self {
        Self::with_shape(Shape::List(item))
    }

    pub fn object<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, SchemaNode)>,
        K: Into<String>,
    {
        Self::with_shape(Shape::Object(
            children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn object_list<I, K>(children: I) -> Self
    where
        I: IntoIterator<Item = (K, SchemaNode)>,
        K: Into<String>,
    {
        Self::with_shape(Shape::ObjectList(
            children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn any_keys(child: SchemaNode) -> Self {
        Self::with_shape(Shape::AnyKeys(Box::new(child)))
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn env(mut self, name: &str) -> Self {
        self.env_override = Some(name.to_string());
        self
    }

    pub fn allowed<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.checks
            .push(Check::AllowedValues(values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn directory(mut self) -> Self {
        self.checks.push(Check::Directory);
        self
    }

    pub fn file(mut self) -> Self {
        self.checks.push(Check::File);
        self
    }

    pub fn non_negative(mut self) -> Self {
        self.checks.push(Check::NonNegative);
        self
    }

    pub fn group_path(mut self) -> Self {
        self.checks.push(Check::GroupPath);
        self
    }

    pub fn side_effect(mut self, handler: &str) -> Self {
        self.side_effect = Some(handler.to_string());
        self
    }

    /// Scalar type of this node, if it holds scalars (directly or in a list)
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match &self.shape {
            Shape::Scalar(t) | Shape::List(t) => Some(*t),
            _ => None,
        }
    }

    /// Child schema of a fixed-key object node
    pub fn children(&self) -> Option<&BTreeMap<String, SchemaNode>> {
        match &self.shape {
            Shape::Object(children) | Shape::ObjectList(children) => Some(children),
            _ => None,
        }
    }

    /// The kind set of this node
    pub fn kinds(&self) -> BTreeSet<Kind> {
        let mut kinds = BTreeSet::new();
        match &self.shape {
            Shape::Scalar(t) => {
                kinds.insert(scalar_kind(*t));
            }
            Shape::List(t) => {
                kinds.insert(Kind::List);
                kinds.insert(scalar_kind(*t));
            }
            Shape::Object(_) => {
                kinds.insert(Kind::Object);
            }
            Shape::ObjectList(_) => {
                kinds.insert(Kind::List);
                kinds.insert(Kind::Object);
            }
            Shape::AnyKeys(child) => {
                kinds.insert(Kind::AnyKeys);
                kinds.extend(child.kinds());
            }
        }
        for check in &self.checks {
            kinds.insert(match check {
                Check::AllowedValues(_) => Kind::HasAllowedValues,
                Check::Directory => Kind::IsDirectory,
                Check::File => Kind::IsFile,
                Check::NonNegative => Kind::IsNonNegative,
                Check::GroupPath => Kind::IsGroupPath,
            });
        }
        if self.side_effect.is_some() {
            kinds.insert(Kind::HasSideEffect);
        }
        kinds
    }
}

fn scalar_kind(t: ScalarType) -> Kind {
    match t {
        ScalarType::String => Kind::String,
        ScalarType::Integer => Kind::Integer,
        ScalarType::Boolean => Kind::Boolean,
    }
}
