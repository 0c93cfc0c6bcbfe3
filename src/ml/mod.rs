pub mod backbone;
pub mod ml_model;
pub mod preprocess;
pub mod inference;
pub mod classifier;

pub use backbone::{EfficientNet, EfficientNetConfig, MbConvStageConfig};
pub use ml_model::{CarClassifierWithOod, ClassifierHead, ModelConfig, FEATURE_DIM, IMAGE_SIZE};
pub use preprocess::{ImagePreprocessor, ImageSource, IMAGENET_MEAN, IMAGENET_STD};
pub use inference::InferenceEngine;
pub use classifier::{Classifier, ImageClassifier};
