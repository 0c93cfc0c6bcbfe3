//! 車種分類器（分布外画像の棄却付き）
//!
//! EfficientNet-B0 の特徴量から車種ヘッドとOODヘッドの2つを計算し、
//! 車でない画像は "Not A Car" として棄却します。
//!
//! ```no_run
//! use car_classifier::{Classifier, ClassifierConfig, ImageClassifier, ImageSource};
//! use std::path::Path;
//!
//! let classifier = Classifier::load(&ClassifierConfig::load_or_default())?;
//! let verdict = classifier.predict(ImageSource::from(Path::new("swift.jpg")), 0.5)?;
//! println!("{} ({:.3})", verdict.predicted_class, verdict.confidence);
//! # Ok::<(), car_classifier::ClassifierError>(())
//! ```

pub mod error;
pub mod types;

pub mod model;
pub mod ml;

pub use error::{ClassifierError, Result};
pub use ml::{Classifier, ImageClassifier, ImageSource, InferenceEngine};
pub use model::{ClassifierConfig, DeviceType, LabelVocabulary, ModelLoader, NOT_A_CAR_LABEL};
pub use types::{Verdict, DEFAULT_OOD_THRESHOLD};
