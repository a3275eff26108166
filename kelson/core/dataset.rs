//! In-memory datasets and the data-loader components that produce them.

use std::path::{Path, PathBuf};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Single training data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Feature vector.
    pub features: Vec<f32>,
    /// Target label.
    pub label: f32,
}

/// Tabular dataset passed between lifecycle stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Where the data came from (file name, generator).
    pub name: String,
    /// Feature column names; may be empty for generated data.
    #[serde(default)]
    pub feature_names: Vec<String>,
    /// Data points.
    pub samples: Vec<DataPoint>,
}

impl Dataset {
    /// Generates a reproducible dataset whose label is the feature sum plus
    /// small noise.
    #[must_use]
    pub fn synthetic(count: usize, feature_dim: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            let features: Vec<f32> = (0..feature_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let label = features.iter().sum::<f32>() + rng.gen_range(-0.1..0.1);
            samples.push(DataPoint { features, label });
        }
        Self {
            name: format!("synthetic-{seed}"),
            feature_names: (0..feature_dim).map(|idx| format!("x{idx}")).collect(),
            samples,
        }
    }

    /// Checks that every row has the width of the first one and returns that
    /// width.
    pub fn validate(&self) -> Result<usize, DataLoaderError> {
        let expected = self.feature_dim();
        match self
            .samples
            .iter()
            .position(|point| point.features.len() != expected)
        {
            Some(row) => Err(DataLoaderError::Ragged {
                row,
                expected,
                found: self.samples[row].features.len(),
            }),
            None => Ok(expected),
        }
    }

    /// Standardizes every feature column to zero mean and unit variance.
    /// Ragged datasets are rejected untouched.
    #[allow(clippy::cast_precision_loss)]
    pub fn standardize(&mut self) -> Result<(), DataLoaderError> {
        let feature_dim = self.validate()?;
        if self.samples.is_empty() {
            return Ok(());
        }
        let count = self.samples.len() as f32;
        let mut means = vec![0.0; feature_dim];
        for point in &self.samples {
            for (idx, value) in point.features.iter().enumerate() {
                means[idx] += value;
            }
        }
        for mean in &mut means {
            *mean /= count;
        }

        let mut deviations = vec![0.0; feature_dim];
        for point in &self.samples {
            for (idx, value) in point.features.iter().enumerate() {
                deviations[idx] += (value - means[idx]).powi(2);
            }
        }
        for deviation in &mut deviations {
            *deviation = (*deviation / count).sqrt().max(1e-6);
        }

        for point in &mut self.samples {
            for (idx, value) in point.features.iter_mut().enumerate() {
                *value = (*value - means[idx]) / deviations[idx];
            }
        }
        Ok(())
    }

    /// Feature dimensionality.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.samples.first().map_or(0, |point| point.features.len())
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True without samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Metadata reported when a data stage completes.
    #[must_use]
    pub fn summary(&self) -> Map<String, Value> {
        let mut summary = Map::new();
        summary.insert("dataset".into(), json!(self.name));
        summary.insert("samples".into(), json!(self.len()));
        summary.insert("features".into(), json!(self.feature_dim()));
        summary
    }
}

/// Component producing a dataset.
pub trait DataLoader: Send + Sync {
    /// Loads the full dataset.
    fn load(&self) -> Result<Dataset, DataLoaderError>;
}

/// Seeded generator, the default loader so `train` works on a fresh project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticDataLoader {
    samples: usize,
    features: usize,
    seed: u64,
}

impl SyntheticDataLoader {
    /// Creates a loader producing `samples` rows of `features` columns.
    #[must_use]
    pub const fn new(samples: usize, features: usize, seed: u64) -> Self {
        Self {
            samples,
            features,
            seed,
        }
    }
}

impl Default for SyntheticDataLoader {
    fn default() -> Self {
        Self::new(128, 4, 42)
    }
}

impl DataLoader for SyntheticDataLoader {
    fn load(&self) -> Result<Dataset, DataLoaderError> {
        if self.samples == 0 || self.features == 0 {
            return Err(DataLoaderError::Empty(format!("synthetic-{}", self.seed)));
        }
        Ok(Dataset::synthetic(self.samples, self.features, self.seed))
    }
}

/// CSV loader: every column but the last is a feature, the last is the label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvDataLoader {
    path: PathBuf,
    has_headers: bool,
}

impl CsvDataLoader {
    /// Loader for a CSV file with a header row.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            has_headers: true,
        }
    }

    /// Treats the first row as data.
    #[must_use]
    pub const fn without_headers(mut self) -> Self {
        self.has_headers = false;
        self
    }

    /// File path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataLoader for CsvDataLoader {
    fn load(&self) -> Result<Dataset, DataLoaderError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.has_headers)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)?;
        let feature_names = if self.has_headers {
            let headers = reader.headers()?;
            let count = headers.len().saturating_sub(1);
            headers.iter().take(count).map(str::to_owned).collect()
        } else {
            Vec::new()
        };

        let mut samples = Vec::new();
        let mut width = None;
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let expected = *width.get_or_insert(record.len());
            if record.len() != expected || expected < 2 {
                return Err(DataLoaderError::Ragged {
                    row,
                    expected: expected.max(2),
                    found: record.len(),
                });
            }
            let mut values = Vec::with_capacity(record.len());
            for (column, field) in record.iter().enumerate() {
                let value = field.parse::<f32>().map_err(|_| DataLoaderError::Parse {
                    row,
                    column,
                    value: field.to_owned(),
                })?;
                values.push(value);
            }
            let label = values.pop().unwrap_or_default();
            samples.push(DataPoint {
                features: values,
                label,
            });
        }
        if samples.is_empty() {
            return Err(DataLoaderError::Empty(self.path.display().to_string()));
        }
        Ok(Dataset {
            name: self
                .path
                .file_name()
                .map_or_else(String::new, |name| name.to_string_lossy().into_owned()),
            feature_names,
            samples,
        })
    }
}

/// Errors raised by data loaders.
#[derive(Debug, Error)]
pub enum DataLoaderError {
    /// The source produced no rows.
    #[error("dataset `{0}` contains no samples")]
    Empty(String),
    /// A row has a different number of columns than the first row.
    #[error("row {row}: expected {expected} columns, found {found}")]
    Ragged {
        /// Zero-based data row.
        row: usize,
        /// Column count of the first row.
        expected: usize,
        /// Column count of this row.
        found: usize,
    },
    /// A cell is not a number.
    #[error("row {row}, column {column}: `{value}` is not a number")]
    Parse {
        /// Zero-based data row.
        row: usize,
        /// Zero-based column.
        column: usize,
        /// Raw cell.
        value: String,
    },
    /// CSV reader failure (includes I/O).
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn synthetic_data_is_reproducible() {
        let first = SyntheticDataLoader::new(16, 3, 7).load().unwrap();
        let second = SyntheticDataLoader::new(16, 3, 7).load().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.feature_dim(), 3);
        assert_ne!(first, SyntheticDataLoader::new(16, 3, 8).load().unwrap());
    }

    #[test]
    fn standardize_centers_features() {
        let mut dataset = Dataset::synthetic(64, 2, 1);
        dataset.standardize().unwrap();
        let mean: f32 = dataset.samples.iter().map(|p| p.features[0]).sum::<f32>() / 64.0;
        assert!(mean.abs() < 1e-4);
    }

    #[test]
    fn ragged_rows_are_rejected_without_panicking() {
        let mut dataset = Dataset {
            name: "ragged".into(),
            feature_names: Vec::new(),
            samples: vec![
                DataPoint { features: vec![1.0], label: 0.0 },
                DataPoint { features: vec![1.0, 2.0], label: 1.0 },
            ],
        };
        assert!(matches!(
            dataset.validate(),
            Err(DataLoaderError::Ragged { row: 1, expected: 1, found: 2 })
        ));
        let before = dataset.clone();
        assert!(dataset.standardize().is_err());
        assert_eq!(dataset, before);
        assert_eq!(Dataset::default().validate().unwrap(), 0);
    }

    #[test]
    fn csv_loader_splits_label_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("iris.csv");
        fs::write(&path, "sepal,petal,label\n1.0,2.0,0\n3.5, 4.5 ,1\n").unwrap();
        let dataset = CsvDataLoader::new(&path).load().unwrap();
        assert_eq!(dataset.name, "iris.csv");
        assert_eq!(dataset.feature_names, vec!["sepal", "petal"]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.samples[1].features, vec![3.5, 4.5]);
        assert!((dataset.samples[1].label - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn csv_loader_reports_bad_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,label\n1.0,0\nfoo,1\n").unwrap();
        let err = CsvDataLoader::new(&path).load().unwrap_err();
        assert!(matches!(err, DataLoaderError::Parse { row: 1, column: 0, .. }));
    }

    #[test]
    fn csv_loader_missing_file() {
        let err = CsvDataLoader::new("/nonexistent/data.csv").load().unwrap_err();
        assert!(matches!(err, DataLoaderError::Csv(_)));
    }
}
