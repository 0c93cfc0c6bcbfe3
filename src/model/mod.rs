pub mod model_metadata;
pub mod model_storage;
pub mod vocabulary;
pub mod loader;
pub mod torch_import;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{
    load_metadata, load_model_binary, load_model_with_metadata, print_metadata_info, save_full_bundle,
    save_model_with_metadata, save_weights,
};
pub use vocabulary::{LabelVocabulary, DEFAULT_CLASS_NAMES, NOT_A_CAR_LABEL};
pub use loader::{ArtifactFormat, LoadedModel, ModelLoader};
pub use torch_import::{apply_state_dict, torch_key_rules};
pub use config::{ClassifierConfig, DeviceType, ModelSettings};
