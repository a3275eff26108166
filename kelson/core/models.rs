//! Built-in models shipped with every project.

use std::sync::Arc;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde_json::json;

use crate::{
    contract::{CapabilitySet, FitResult, Metadata, Method, Model, StageContext, StageError, StageResult},
    dataset::{DataLoader, DataLoaderError, Dataset},
    hyperparams::{HyperparamSchema, HyperparameterSet},
};

/// Linear regression with bias trained by full-batch gradient descent.
///
/// Declares all four stages; `transform` standardizes the features unless the
/// `standardize` hyperparameter is off.
pub struct LinearRegression {
    loader: Arc<dyn DataLoader>,
    learning_rate: f32,
    epochs: usize,
    standardize: bool,
    seed: u64,
    feature_dim: usize,
    weights: Vec<f32>,
    bias: f32,
}

impl LinearRegression {
    /// Creates an untrained model reading from `loader`.
    #[must_use]
    pub fn new(loader: Arc<dyn DataLoader>) -> Self {
        Self {
            loader,
            learning_rate: 0.05,
            epochs: 10,
            standardize: true,
            seed: 42,
            feature_dim: 0,
            weights: Vec::new(),
            bias: 0.0,
        }
    }

    /// Learned weights; empty before `build`.
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Predicts one label per feature row.
    #[must_use]
    pub fn predict(&self, data: &Dataset) -> Vec<f32> {
        data.samples
            .iter()
            .map(|point| {
                point
                    .features
                    .iter()
                    .zip(&self.weights)
                    .map(|(feature, weight)| feature * weight)
                    .sum::<f32>()
                    + self.bias
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn step(&mut self, data: &Dataset) {
        let count = data.len() as f32;
        let errors: Vec<f32> = self
            .predict(data)
            .iter()
            .zip(&data.samples)
            .map(|(prediction, point)| prediction - point.label)
            .collect();
        for (idx, weight) in self.weights.iter_mut().enumerate() {
            let grad = errors
                .iter()
                .zip(&data.samples)
                .map(|(err, point)| err * point.features[idx])
                .sum::<f32>()
                / count;
            *weight -= self.learning_rate * grad;
        }
        self.bias -= self.learning_rate * errors.iter().sum::<f32>() / count;
    }
}

impl Model for LinearRegression {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::lifecycle()
    }

    fn hyperparameters(&self) -> HyperparamSchema {
        HyperparamSchema::new()
            .float("learning_rate", 0.05)
            .int("epochs", 10)
            .bool("standardize", true)
            .int("seed", 42)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    fn configure(&mut self, params: &HyperparameterSet) -> StageResult<()> {
        let learning_rate = params.float("learning_rate").unwrap_or(0.05);
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(StageError::domain(
                "InvalidHyperparameter",
                format!("learning_rate must be positive, got {learning_rate}"),
            ));
        }
        let epochs = params.int("epochs").unwrap_or(10);
        if epochs < 1 {
            return Err(StageError::domain(
                "InvalidHyperparameter",
                format!("epochs must be at least 1, got {epochs}"),
            ));
        }
        self.learning_rate = learning_rate as f32;
        self.epochs = epochs as usize;
        self.standardize = params.bool("standardize").unwrap_or(true);
        self.seed = params.int("seed").unwrap_or(42) as u64;
        Ok(())
    }

    fn load_data(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
        let data = self.loader.load()?;
        self.feature_dim = checked_shape(&data)?;
        Ok(data)
    }

    fn transform(&mut self, mut data: Dataset, _ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
        if self.standardize {
            data.standardize().map_err(invalid_shape)?;
        }
        Ok(data)
    }

    fn build(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Metadata> {
        if self.feature_dim == 0 {
            return Err(StageError::domain("InvalidShape", "dataset has no features"));
        }
        let mut rng = SmallRng::seed_from_u64(self.seed);
        self.weights = (0..self.feature_dim)
            .map(|_| rng.gen_range(-0.05..0.05))
            .collect();
        self.bias = rng.gen_range(-0.05..0.05);

        let mut metadata = Metadata::new();
        metadata.insert("parameters".into(), json!(self.feature_dim + 1));
        metadata.insert("learning_rate".into(), json!(self.learning_rate));
        metadata.insert("epochs".into(), json!(self.epochs));
        Ok(metadata)
    }

    fn fit(&mut self, data: &Dataset, ctx: &mut StageContext<'_>) -> StageResult<FitResult> {
        let feature_dim = checked_shape(data)?;
        if feature_dim != self.weights.len() {
            return Err(StageError::domain(
                "InvalidShape",
                format!(
                    "model expects {} features, dataset has {feature_dim}",
                    self.weights.len()
                ),
            ));
        }
        let mut loss = f32::NAN;
        for epoch in 1..=self.epochs {
            ctx.checkpoint()?;
            self.step(data);
            loss = mean_squared_error(&self.predict(data), data);
            if !loss.is_finite() {
                return Err(StageError::domain(
                    "Diverged",
                    format!("loss became {loss} at epoch {epoch}"),
                ));
            }
            ctx.log(json!({ "epoch": epoch, "loss": loss }));
        }
        Ok(FitResult::new().metric("loss", loss).metric("epochs", self.epochs))
    }
}

/// Predicts the mean training label. Skips `transform`.
pub struct MeanBaseline {
    loader: Arc<dyn DataLoader>,
    mean: f32,
}

impl MeanBaseline {
    /// Creates the baseline reading from `loader`.
    #[must_use]
    pub fn new(loader: Arc<dyn DataLoader>) -> Self {
        Self { loader, mean: 0.0 }
    }

    /// Learned mean.
    #[must_use]
    pub const fn mean(&self) -> f32 {
        self.mean
    }
}

impl Model for MeanBaseline {
    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Method::LoadData, Method::Build, Method::Fit])
    }

    fn load_data(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Dataset> {
        Ok(self.loader.load()?)
    }

    fn build(&mut self, _ctx: &mut StageContext<'_>) -> StageResult<Metadata> {
        self.mean = 0.0;
        Ok(Metadata::new())
    }

    #[allow(clippy::cast_precision_loss)]
    fn fit(&mut self, data: &Dataset, ctx: &mut StageContext<'_>) -> StageResult<FitResult> {
        if data.is_empty() {
            return Err(StageError::domain("InvalidShape", "dataset is empty"));
        }
        self.mean = data.samples.iter().map(|point| point.label).sum::<f32>() / data.len() as f32;
        let predictions = vec![self.mean; data.len()];
        let loss = mean_squared_error(&predictions, data);
        ctx.log(json!({ "epoch": 1, "loss": loss }));
        Ok(FitResult::new().metric("loss", loss).metric("mean", self.mean))
    }
}

fn checked_shape(data: &Dataset) -> StageResult<usize> {
    data.validate().map_err(invalid_shape)
}

fn invalid_shape(err: DataLoaderError) -> StageError {
    StageError::domain("InvalidShape", err.to_string())
}

#[allow(clippy::cast_precision_loss)]
fn mean_squared_error(predictions: &[f32], data: &Dataset) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    predictions
        .iter()
        .zip(&data.samples)
        .map(|(prediction, point)| (prediction - point.label).powi(2))
        .sum::<f32>()
        / data.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contract::{MetricReporter, NullReporter},
        dataset::{DataPoint, SyntheticDataLoader},
        hyperparams::{parse_overrides, ParamLayer},
    };
    use kelson_events::Stage;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Losses(Vec<f64>);

    impl MetricReporter for Losses {
        fn report(&mut self, _stage: Stage, payload: Metadata) {
            if let Some(loss) = payload.get("loss").and_then(Value::as_f64) {
                self.0.push(loss);
            }
        }
    }

    fn loader() -> Arc<dyn DataLoader> {
        Arc::new(SyntheticDataLoader::new(64, 3, 9))
    }

    fn configured(overrides: &[&str]) -> (LinearRegression, HyperparameterSet) {
        let mut model = LinearRegression::new(loader());
        let overrides = parse_overrides(overrides).unwrap();
        let params = model
            .hyperparameters()
            .resolve(&ParamLayer::new(), &overrides)
            .unwrap();
        model.configure(&params).unwrap();
        (model, params)
    }

    #[test]
    fn linear_regression_reduces_loss() {
        let (mut model, params) = configured(&["epochs=30", "learning_rate=0.1"]);
        let token = CancellationToken::new();
        let mut losses = Losses::default();
        let data = {
            let mut ctx = StageContext::new(Stage::LoadData, &mut losses, &token, &params);
            model.load_data(&mut ctx).unwrap()
        };
        let mut ctx = StageContext::new(Stage::Transform, &mut losses, &token, &params);
        let data = model.transform(data, &mut ctx).unwrap();
        let mut ctx = StageContext::new(Stage::Build, &mut losses, &token, &params);
        let metadata = model.build(&mut ctx).unwrap();
        assert_eq!(metadata["parameters"], json!(4));
        let mut ctx = StageContext::new(Stage::Fit, &mut losses, &token, &params);
        model.fit(&data, &mut ctx).unwrap();

        assert_eq!(losses.0.len(), 30);
        assert!(losses.0[29] < losses.0[0]);
        assert_eq!(model.weights().len(), 3);
    }

    #[test]
    fn huge_learning_rate_diverges() {
        let (mut model, params) = configured(&["learning_rate=1e30", "epochs=5"]);
        let token = CancellationToken::new();
        let mut reporter = NullReporter;
        let mut ctx = StageContext::new(Stage::Fit, &mut reporter, &token, &params);
        let data = model.load_data(&mut ctx).unwrap();
        model.build(&mut ctx).unwrap();
        let err = model.fit(&data, &mut ctx).unwrap_err();
        assert_eq!(err.kind(), "Diverged");
    }

    #[test]
    fn configure_rejects_non_positive_learning_rate() {
        let mut model = LinearRegression::new(loader());
        let overrides = parse_overrides(["learning_rate=0"]).unwrap();
        let params = model
            .hyperparameters()
            .resolve(&ParamLayer::new(), &overrides)
            .unwrap();
        let err = model.configure(&params).unwrap_err();
        assert_eq!(err.kind(), "InvalidHyperparameter");
    }

    #[test]
    fn fit_stops_at_cancel_checkpoint() {
        let (mut model, params) = configured(&[]);
        let token = CancellationToken::new();
        let mut reporter = NullReporter;
        let mut ctx = StageContext::new(Stage::Fit, &mut reporter, &token, &params);
        let data = model.load_data(&mut ctx).unwrap();
        model.build(&mut ctx).unwrap();
        token.cancel();
        let mut ctx = StageContext::new(Stage::Fit, &mut reporter, &token, &params);
        assert!(matches!(model.fit(&data, &mut ctx), Err(StageError::Cancelled)));
    }

    struct Ragged;

    impl DataLoader for Ragged {
        fn load(&self) -> Result<Dataset, DataLoaderError> {
            Ok(Dataset {
                name: "ragged".into(),
                feature_names: Vec::new(),
                samples: vec![
                    DataPoint { features: vec![1.0], label: 0.0 },
                    DataPoint { features: vec![1.0, 2.0], label: 1.0 },
                ],
            })
        }
    }

    #[test]
    fn ragged_data_is_an_invalid_shape() {
        let mut model = LinearRegression::new(Arc::new(Ragged));
        let params = model
            .hyperparameters()
            .resolve(&ParamLayer::new(), &ParamLayer::new())
            .unwrap();
        model.configure(&params).unwrap();
        let token = CancellationToken::new();
        let mut reporter = NullReporter;
        let mut ctx = StageContext::new(Stage::LoadData, &mut reporter, &token, &params);
        let err = model.load_data(&mut ctx).unwrap_err();
        assert_eq!(err.kind(), "InvalidShape");

        let ragged = Ragged.load().unwrap();
        let err = model.transform(ragged.clone(), &mut ctx).unwrap_err();
        assert_eq!(err.kind(), "InvalidShape");
        let err = model.fit(&ragged, &mut ctx).unwrap_err();
        assert_eq!(err.kind(), "InvalidShape");
    }

    #[test]
    fn baseline_learns_label_mean_without_transform() {
        let mut model = MeanBaseline::new(loader());
        assert!(!model.capabilities().contains(Method::Transform));
        let token = CancellationToken::new();
        let params = HyperparameterSet::default();
        let mut losses = Losses::default();
        let mut ctx = StageContext::new(Stage::Fit, &mut losses, &token, &params);
        let data = model.load_data(&mut ctx).unwrap();
        model.build(&mut ctx).unwrap();
        let result = model.fit(&data, &mut ctx).unwrap();

        let expected = data.samples.iter().map(|p| p.label).sum::<f32>() / 64.0;
        assert!((model.mean() - expected).abs() < 1e-5);
        assert!(result.metrics.contains_key("loss"));
        assert_eq!(losses.0.len(), 1);
    }
}
