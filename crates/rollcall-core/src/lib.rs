//! rollcall-core — face enrollment store and recognition.
//!
//! Embeddings are kept per person in a single JSON store and matched by
//! linear scan. Extraction sits behind [`EmbeddingExtractor`]; the shipped
//! implementation runs SCRFD detection and ArcFace recognition via ONNX
//! Runtime.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod onnx;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

pub use extractor::{EmbeddingExtractor, ExtractError, FaceRegion};
pub use matcher::{MatchEngine, MatchResult, Metric};
pub use onnx::OnnxExtractor;
pub use service::{EnrollReport, EnrollmentService, Recognition, RecognitionService, ServiceError};
pub use store::{EmbeddingStore, Store, StoreError};
pub use types::{BoundingBox, Embedding};
