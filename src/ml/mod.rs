pub mod backbone;
pub mod evaluation;
pub mod experiment;
pub mod inference;
pub mod metrics;
pub mod ml_model;
pub mod training;

pub use backbone::{Backbone, BackboneFactory, BackboneKind, InputShape, PretrainedBackbone};
pub use evaluation::{evaluate, Evaluation};
pub use experiment::{run_experiment, ExperimentSummary};
pub use inference::{InferenceEngine, Prediction};
pub use metrics::{ClassificationReport, ConfusionMatrix, MetricsRow};
pub use ml_model::{ModelConfig, TumorClassifier, IMAGE_SIZE, NUM_CLASSES};
pub use training::{train, train_and_evaluate, DataSplits, SplitScores, TrainingHistory, TrainingRun};
