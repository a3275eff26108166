//! Project and model scaffolding behind `kelson new` and `kelson make:model`.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static MODEL_STUB: &str = include_str!("stubs/model.stub");
static MAIN_STUB: &str = include_str!("stubs/main.stub");

static WORD_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(.)([A-Z][a-z]+)").expect("valid word boundary regex"));
static CASE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid case boundary regex"));
static MODEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("valid model name regex"));
static PROJECT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid project name regex"));

/// Directory holding model sources inside a project.
pub const MODELS_DIR: &str = "src/models";

/// Project entry point that builds the component catalog.
pub const ENTRY_POINT: &str = "src/main.rs";

/// Line in the entry point above which `make:model` registers models.
pub const MODELS_MARKER: &str = "// kelson:models";

/// `IrisClassifier` → `iris_classifier`, `HTTPServer` → `http_server`.
#[must_use]
pub fn to_snake_case(name: &str) -> String {
    let words = WORD_BOUNDARY.replace_all(name, "${1}_${2}");
    CASE_BOUNDARY.replace_all(&words, "${1}_${2}").to_lowercase()
}

/// Writes `src/models/<snake_name>.rs` for model `name`, declares the module
/// in `src/models/mod.rs` and adds the model to the entry point's catalog.
/// Either registration is skipped when its file (or the marker) is absent.
pub fn generate_model_file(project_root: impl AsRef<Path>, name: &str) -> Result<PathBuf, ScaffoldError> {
    if !MODEL_NAME.is_match(name) {
        return Err(ScaffoldError::InvalidName {
            name: name.to_owned(),
            expected: "a CamelCase identifier such as IrisClassifier",
        });
    }
    let models = project_root.as_ref().join(MODELS_DIR);
    if !models.is_dir() {
        return Err(ScaffoldError::NotAProject { missing: models });
    }
    let module = to_snake_case(name);
    let path = models.join(format!("{module}.rs"));
    if path.exists() {
        return Err(ScaffoldError::AlreadyExists { path });
    }

    write(&path, &MODEL_STUB.replace("{{ class_name }}", name))?;

    let mod_file = models.join("mod.rs");
    if mod_file.is_file() {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&mod_file)
            .map_err(|source| ScaffoldError::io(&mod_file, source))?;
        writeln!(file, "pub mod {module};").map_err(|source| ScaffoldError::io(&mod_file, source))?;
    }
    register_model(&project_root.as_ref().join(ENTRY_POINT), &module, name)?;
    Ok(path)
}

fn register_model(entry_point: &Path, module: &str, name: &str) -> Result<(), ScaffoldError> {
    if !entry_point.is_file() {
        return Ok(());
    }
    let mut source = fs::read_to_string(entry_point).map_err(|err| ScaffoldError::io(entry_point, err))?;
    let Some(at) = source.find(MODELS_MARKER) else {
        return Ok(());
    };
    let indent = &source[source[..at].rfind('\n').map_or(0, |nl| nl + 1)..at];
    let registration = format!(".model(\"{name}\", models::{module}::{name}::new)\n{indent}");
    source.insert_str(at, &registration);
    write(entry_point, &source)
}

/// Creates a new project directory `parent/name` with the standard layout.
pub fn scaffold_project(parent: impl AsRef<Path>, name: &str) -> Result<PathBuf, ScaffoldError> {
    if !PROJECT_NAME.is_match(name) {
        return Err(ScaffoldError::InvalidName {
            name: name.to_owned(),
            expected: "letters, digits, `-` or `_`, starting with a letter",
        });
    }
    let root = parent.as_ref().join(name);
    if root.exists() {
        return Err(ScaffoldError::AlreadyExists { path: root });
    }

    for dir in [MODELS_DIR, "config", "database/datasets", "storage/checkpoints", "storage/logs"] {
        let path = root.join(dir);
        fs::create_dir_all(&path).map_err(|source| ScaffoldError::io(&path, source))?;
    }
    for keep in ["database/datasets/.gitkeep", "storage/checkpoints/.gitkeep"] {
        write(&root.join(keep), "")?;
    }

    write(&root.join("Cargo.toml"), &cargo_manifest(name))?;
    write(
        &root.join("README.md"),
        &format!("# {name}\n\nA Kelson machine learning project.\n\n    kelson make:model IrisClassifier\n    cargo run -- IrisClassifier --param epochs=20\n"),
    )?;
    write(&root.join("src/lib.rs"), "pub mod models;\n")?;
    write(&root.join(ENTRY_POINT), &entry_point(name))?;
    write(&root.join(MODELS_DIR).join("mod.rs"), "//! Project models.\n")?;
    write(&root.join("config/app.yaml"), &app_config(name))?;
    write(&root.join("config/data.yaml"), DATA_CONFIG)?;
    write(&root.join("config/ml.yaml"), ML_CONFIG)?;
    Ok(root)
}

fn cargo_manifest(name: &str) -> String {
    format!(
        r#"[package]
name = "{name}"
version = "0.1.0"
edition = "2021"

[dependencies]
anyhow = "1"
clap = {{ version = "4", features = ["derive"] }}
kelson-core = "0.1"
serde_json = "1"
"#
    )
}

fn entry_point(name: &str) -> String {
    MAIN_STUB
        .replace("{{ crate_name }}", &name.replace('-', "_"))
        .replace("{{ models_marker }}", MODELS_MARKER)
}

fn app_config(name: &str) -> String {
    format!(
        r#"app:
  name: "{name}"
  env: "local"
  debug: true

storage:
  checkpoints_path: "storage/checkpoints"
"#
    )
}

const DATA_CONFIG: &str = r#"# DataLoader implementation: synthetic | csv
loader: "synthetic"
samples: 128
features: 4
seed: 42
# path: "database/datasets/iris.csv"
"#;

const ML_CONFIG: &str = r#"# Hyperparameters per model, overridable with `--param key=value`.
models:
  LinearRegression:
    learning_rate: 0.05
    epochs: 10

# Capability -> implementation, e.g. `EventSink: jsonl`.
bindings:
  EventSink: "memory"
"#;

fn write(path: &Path, contents: &str) -> Result<(), ScaffoldError> {
    fs::write(path, contents).map_err(|source| ScaffoldError::io(path, source))
}

/// Errors raised by the scaffolding commands.
#[derive(Debug, Error)]
pub enum ScaffoldError {
    /// The requested name is not usable.
    #[error("invalid name `{name}`: expected {expected}")]
    InvalidName {
        /// Rejected name.
        name: String,
        /// What a valid name looks like.
        expected: &'static str,
    },
    /// The current directory is not a Kelson project.
    #[error("{} not found; run this inside a Kelson project", missing.display())]
    NotAProject {
        /// Missing directory.
        missing: PathBuf,
    },
    /// The target already exists.
    #[error("{} already exists", path.display())]
    AlreadyExists {
        /// Existing path.
        path: PathBuf,
    },
    /// Filesystem failure.
    #[error("writing {}: {source}", path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl ScaffoldError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
