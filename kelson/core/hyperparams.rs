//! Typed hyperparameter schemas and precedence-ordered resolution.
//!
//! A component declares its hyperparameters (name, type, default) through a
//! [`HyperparamSchema`]. The resolved [`HyperparameterSet`] is the schema
//! defaults overlaid by the config layer, overlaid by run-time overrides. The
//! higher layer always wins.

use std::{collections::BTreeMap, fmt};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One layer of raw hyperparameter values (config entries or overrides).
pub type ParamLayer = BTreeMap<String, ParamValue>;

/// Scalar hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free-form string.
    Str(String),
}

impl ParamValue {
    /// Type of the value.
    #[must_use]
    pub const fn kind(&self) -> ParamKind {
        match self {
            Self::Bool(_) => ParamKind::Bool,
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::Str(_) => ParamKind::Str,
        }
    }

    /// Converts a JSON scalar. Arrays, objects, and null yield `None`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(flag) => Some(Self::Bool(*flag)),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float)),
            Value::String(text) => Some(Self::Str(text.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// JSON representation.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Int(number) => Value::from(*number),
            Self::Float(number) => Value::from(*number),
            Self::Str(text) => Value::String(text.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(number) => write!(f, "{number}"),
            Self::Float(number) => write!(f, "{number}"),
            Self::Str(text) => f.write_str(text),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Declared type of a hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// `true` / `false`.
    Bool,
    /// Integer.
    Int,
    /// Float.
    Float,
    /// String.
    Str,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "string",
        })
    }
}

impl ParamKind {
    /// Converts `value` to this kind. Integers widen to floats and strings are
    /// parsed (command-line overrides arrive as strings); anything else is a
    /// mismatch.
    pub fn coerce(self, name: &str, value: &ParamValue) -> Result<ParamValue, HyperparameterError> {
        let mismatch = || HyperparameterError::TypeMismatch {
            name: name.to_owned(),
            expected: self,
            found: value.to_string(),
        };
        match (self, value) {
            (Self::Bool, ParamValue::Bool(_))
            | (Self::Int, ParamValue::Int(_))
            | (Self::Float, ParamValue::Float(_))
            | (Self::Str, ParamValue::Str(_)) => Ok(value.clone()),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, ParamValue::Int(number)) => Ok(ParamValue::Float(*number as f64)),
            (Self::Bool, ParamValue::Str(raw)) => match raw.trim() {
                "true" | "yes" | "on" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err(mismatch()),
            },
            (Self::Int, ParamValue::Str(raw)) => {
                raw.trim().parse().map(ParamValue::Int).map_err(|_| mismatch())
            }
            (Self::Float, ParamValue::Str(raw)) => {
                raw.trim().parse().map(ParamValue::Float).map_err(|_| mismatch())
            }
            (Self::Str, other) => Ok(ParamValue::Str(other.to_string())),
            _ => Err(mismatch()),
        }
    }
}

/// Declaration of a single hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub kind: ParamKind,
    /// Value used when no layer sets the parameter.
    pub default: ParamValue,
}

/// Ordered set of hyperparameter declarations for one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperparamSchema {
    specs: IndexMap<String, ParamSpec>,
}

impl HyperparamSchema {
    /// Empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a float parameter.
    #[must_use]
    pub fn float(self, name: &str, default: f64) -> Self {
        self.declare(name, ParamValue::Float(default))
    }

    /// Declares an integer parameter.
    #[must_use]
    pub fn int(self, name: &str, default: i64) -> Self {
        self.declare(name, ParamValue::Int(default))
    }

    /// Declares a boolean parameter.
    #[must_use]
    pub fn bool(self, name: &str, default: bool) -> Self {
        self.declare(name, ParamValue::Bool(default))
    }

    /// Declares a string parameter.
    #[must_use]
    pub fn string(self, name: &str, default: &str) -> Self {
        self.declare(name, ParamValue::Str(default.to_owned()))
    }

    fn declare(mut self, name: &str, default: ParamValue) -> Self {
        self.specs.insert(
            name.to_owned(),
            ParamSpec {
                name: name.to_owned(),
                kind: default.kind(),
                default,
            },
        );
        self
    }

    /// Looks up a declaration.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.get(name)
    }

    /// Declarations in declaration order.
    pub fn specs(&self) -> impl Iterator<Item = &ParamSpec> {
        self.specs.values()
    }

    /// Number of declared parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Keys of `layer` this schema does not declare.
    #[must_use]
    pub fn undeclared<'a>(&self, layer: &'a ParamLayer) -> Vec<&'a str> {
        layer
            .keys()
            .filter(|key| !self.specs.contains_key(key.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Merges defaults ⊕ `config` ⊕ `overrides`.
    ///
    /// Config keys the schema does not declare are ignored (a shared config
    /// file may carry keys for other tooling); undeclared override keys are
    /// rejected since they almost always are typos on the command line.
    pub fn resolve(
        &self,
        config: &ParamLayer,
        overrides: &ParamLayer,
    ) -> Result<HyperparameterSet, HyperparameterError> {
        if let Some(name) = self.undeclared(overrides).first() {
            return Err(HyperparameterError::Unknown {
                name: (*name).to_owned(),
            });
        }
        let mut values = BTreeMap::new();
        for spec in self.specs.values() {
            let value = match overrides.get(&spec.name).or_else(|| config.get(&spec.name)) {
                Some(raw) => spec.kind.coerce(&spec.name, raw)?,
                None => spec.default.clone(),
            };
            values.insert(spec.name.clone(), value);
        }
        Ok(HyperparameterSet { values })
    }
}

/// Resolved hyperparameters, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl HyperparameterSet {
    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Float value (integers widen).
    #[must_use]
    pub fn float(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            ParamValue::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            ParamValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Integer value.
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Boolean value.
    #[must_use]
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// String value.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ParamValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Iterates name/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object for event payloads.
    #[must_use]
    pub fn to_json(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

/// Splits a `key=value` override. The value stays a string until it is
/// coerced against the schema.
pub fn parse_override(raw: &str) -> Result<(String, ParamValue), HyperparameterError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((
            key.trim().to_owned(),
            ParamValue::Str(value.trim().to_owned()),
        )),
        _ => Err(HyperparameterError::MalformedOverride(raw.to_owned())),
    }
}

/// Parses every `key=value` override into a layer; later duplicates win.
pub fn parse_overrides<I, S>(raw: I) -> Result<ParamLayer, HyperparameterError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|entry| parse_override(entry.as_ref()))
        .collect()
}

/// Errors raised while resolving hyperparameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HyperparameterError {
    /// Override for a parameter the component does not declare.
    #[error("unknown hyperparameter `{name}`")]
    Unknown {
        /// Parameter name.
        name: String,
    },
    /// Value cannot be converted to the declared type.
    #[error("hyperparameter `{name}` expects {expected}, got `{found}`")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Declared type.
        expected: ParamKind,
        /// Offending value.
        found: String,
    },
    /// Override not in `key=value` form.
    #[error("malformed override `{0}`, expected key=value")]
    MalformedOverride(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> HyperparamSchema {
        HyperparamSchema::new()
            .float("learning_rate", 0.1)
            .int("epochs", 10)
            .bool("shuffle", true)
            .string("optimizer", "sgd")
    }

    fn layer(entries: &[(&str, ParamValue)]) -> ParamLayer {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn override_beats_config_beats_default() {
        let config = layer(&[
            ("learning_rate", ParamValue::Float(0.01)),
            ("epochs", ParamValue::Int(20)),
        ]);
        let overrides = layer(&[("learning_rate", ParamValue::Float(0.05))]);
        let set = schema().resolve(&config, &overrides).unwrap();
        assert_eq!(set.float("learning_rate"), Some(0.05));
        assert_eq!(set.int("epochs"), Some(20));
        assert_eq!(set.bool("shuffle"), Some(true));
        assert_eq!(set.string("optimizer"), Some("sgd"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let config = layer(&[("epochs", ParamValue::Int(3))]);
        let overrides = parse_overrides(["learning_rate=0.2", "shuffle=false"]).unwrap();
        let first = schema().resolve(&config, &overrides).unwrap();
        for _ in 0..10 {
            assert_eq!(schema().resolve(&config, &overrides).unwrap(), first);
        }
        let names: Vec<&str> = first.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["epochs", "learning_rate", "optimizer", "shuffle"]);
    }

    #[test]
    fn string_overrides_are_coerced_to_declared_kind() {
        let overrides = parse_overrides(["epochs=7", "learning_rate=1", "shuffle=no"]).unwrap();
        let set = schema().resolve(&ParamLayer::new(), &overrides).unwrap();
        assert_eq!(set.int("epochs"), Some(7));
        assert_eq!(set.float("learning_rate"), Some(1.0));
        assert_eq!(set.bool("shuffle"), Some(false));
    }

    #[test]
    fn integer_config_widens_to_float() {
        let config = layer(&[("learning_rate", ParamValue::Int(1))]);
        let set = schema().resolve(&config, &ParamLayer::new()).unwrap();
        assert_eq!(set.get("learning_rate"), Some(&ParamValue::Float(1.0)));
    }

    #[test]
    fn rejects_type_mismatch() {
        let config = layer(&[("epochs", ParamValue::Float(2.5))]);
        let err = schema().resolve(&config, &ParamLayer::new()).unwrap_err();
        assert!(matches!(err, HyperparameterError::TypeMismatch { ref name, .. } if name == "epochs"));
    }

    #[test]
    fn unknown_override_is_rejected_but_unknown_config_is_ignored() {
        let config = layer(&[("dropout", ParamValue::Float(0.3))]);
        let set = schema().resolve(&config, &ParamLayer::new()).unwrap();
        assert!(set.get("dropout").is_none());

        let overrides = parse_overrides(["dropuot=0.3"]).unwrap();
        let err = schema().resolve(&ParamLayer::new(), &overrides).unwrap_err();
        assert_eq!(
            err,
            HyperparameterError::Unknown {
                name: "dropuot".into()
            }
        );
    }

    #[test]
    fn malformed_override() {
        assert!(matches!(
            parse_override("epochs"),
            Err(HyperparameterError::MalformedOverride(_))
        ));
        assert!(parse_override("=3").is_err());
        let (key, value) = parse_override(" epochs = 4 ").unwrap();
        assert_eq!(key, "epochs");
        assert_eq!(value, ParamValue::Str("4".into()));
    }
}
