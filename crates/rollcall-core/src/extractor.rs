//! Face extraction seam: detection + embedding, behind one trait so the
//! services can be driven by the ONNX models or by a test double.

use crate::types::{BoundingBox, Embedding};
use image::{DynamicImage, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One detected face: where it is, and the aligned crop used for embedding.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    /// Aligned crop, or `None` when the detector gave no landmarks to align with.
    pub crop: Option<RgbImage>,
}

/// Turns images into face embeddings.
pub trait EmbeddingExtractor {
    /// Locate faces, strongest detection first.
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, ExtractError>;

    /// Embed one detected face. `Ok(None)` means the face was not usable
    /// (low detection confidence, nothing to align); it is not an error.
    fn embed(&mut self, face: &FaceRegion) -> Result<Option<Embedding>, ExtractError>;

    /// Embedding of the dominant (highest-confidence) face, if any.
    fn dominant_embedding(&mut self, image: &DynamicImage) -> Result<Option<Embedding>, ExtractError> {
        let faces = self.detect(image)?;
        // Earliest face wins on equal confidence.
        let dominant = faces.iter().reduce(|best, face| {
            if face.bbox.confidence > best.bbox.confidence {
                face
            } else {
                best
            }
        });
        match dominant {
            Some(face) => self.embed(face),
            None => Ok(None),
        }
    }
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for &mut E {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, ExtractError> {
        (**self).detect(image)
    }

    fn embed(&mut self, face: &FaceRegion) -> Result<Option<Embedding>, ExtractError> {
        (**self).embed(face)
    }
}
