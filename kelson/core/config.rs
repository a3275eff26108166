//! Read-only configuration tree assembled from the project's `config/` directory.
//!
//! Every `*.yaml`, `*.yml`, or `*.toml` file becomes a top-level key named after
//! its file stem, so `config/ml.yaml` is reachable as `ml.*`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hyperparams::{ParamLayer, ParamValue};

/// Capability selected by the legacy `data.loader` key.
const DATA_LOADER_KEY: &str = "data.loader";

/// Immutable, merged configuration values addressed by dotted keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Map<String, Value>,
}

impl ConfigTree {
    /// Empty tree.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps an already-parsed JSON object; non-objects give an empty tree.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => Self::default(),
        }
    }

    /// Loads every config file of `dir`. A missing directory yields an empty
    /// tree. Files are read in name order; two files sharing a stem are deep
    /// merged with the later one winning.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(Self::default());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Format::of(path).is_some())
            .collect();
        files.sort();

        let mut root = Map::new();
        for path in files {
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let stem = stem.to_owned();
            let parsed = parse_file(&path)?;
            match root.get_mut(&stem) {
                Some(existing) => deep_merge(existing, parsed),
                None => {
                    root.insert(stem, parsed);
                }
            }
        }
        Ok(Self { root })
    }

    /// Looks up a dotted key such as `ml.models.Iris.learning_rate`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// String lookup.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Unsigned integer lookup.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// String lookup failing with [`ConfigError::Missing`].
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_str(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_owned(),
        })
    }

    /// True when nothing was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Mid-precedence hyperparameter layer of a model: `ml.models.<name>`.
    pub fn model_layer(&self, model: &str) -> Result<ParamLayer, ConfigError> {
        let key = format!("ml.models.{model}");
        let Some(section) = self.get(&key) else {
            return Ok(ParamLayer::new());
        };
        let section = section
            .as_object()
            .ok_or_else(|| ConfigError::NotAMapping { key: key.clone() })?;
        section
            .iter()
            .map(|(name, value)| {
                ParamValue::from_json(value)
                    .map(|value| (name.clone(), value))
                    .ok_or_else(|| ConfigError::NotScalar {
                        key: format!("{key}.{name}"),
                    })
            })
            .collect()
    }

    /// Capability → implementation selections. `data.loader` selects the
    /// `DataLoader` implementation unless `ml.bindings` names one explicitly.
    pub fn bindings(&self) -> Result<IndexMap<String, String>, ConfigError> {
        let mut selected = IndexMap::new();
        if let Some(loader) = self.get(DATA_LOADER_KEY) {
            let loader = loader.as_str().ok_or_else(|| ConfigError::NotScalar {
                key: DATA_LOADER_KEY.to_owned(),
            })?;
            selected.insert(crate::container::DATA_LOADER.to_owned(), loader.to_owned());
        }
        if let Some(section) = self.get("ml.bindings") {
            let section = section.as_object().ok_or_else(|| ConfigError::NotAMapping {
                key: "ml.bindings".into(),
            })?;
            for (capability, implementation) in section {
                let implementation =
                    implementation
                        .as_str()
                        .ok_or_else(|| ConfigError::NotScalar {
                            key: format!("ml.bindings.{capability}"),
                        })?;
                selected.insert(capability.clone(), implementation.to_owned());
            }
        }
        Ok(selected)
    }
}

#[derive(Debug, Clone, Copy)]
enum Format {
    Yaml,
    Toml,
}

impl Format {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

fn parse_file(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = match Format::of(path) {
        Some(Format::Yaml) => {
            serde_yaml::from_str::<Value>(&raw).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })?
        }
        Some(Format::Toml) => toml::from_str::<Value>(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?,
        None => Value::Null,
    };
    // An empty YAML document parses to null.
    Ok(if value.is_null() {
        Value::Object(Map::new())
    } else {
        value
    })
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// Errors raised while loading or reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem failure.
    #[error("reading config {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Invalid YAML.
    #[error("parsing {path}: {source}")]
    Yaml {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: serde_yaml::Error,
    },
    /// Invalid TOML.
    #[error("parsing {path}: {source}")]
    Toml {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A section expected to be a mapping is something else.
    #[error("config key `{key}` must be a mapping")]
    NotAMapping {
        /// Dotted key.
        key: String,
    },
    /// A value expected to be a scalar is a list or mapping.
    #[error("config key `{key}` must be a scalar")]
    NotScalar {
        /// Dotted key.
        key: String,
    },
    /// A required key is absent.
    #[error("config key `{key}` is required")]
    Missing {
        /// Dotted key.
        key: String,
    },
}
