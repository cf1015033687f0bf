pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, DataSettings, DeviceType, ModelSettings, TrainingSettings};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    load_classifier, load_metadata, load_model_with_metadata,
    print_metadata_info, save_classifier, save_model_with_metadata,
};
