//! [`EmbeddingExtractor`] backed by the SCRFD + ArcFace ONNX models.

use crate::alignment;
use crate::detector::FaceDetector;
use crate::extractor::{EmbeddingExtractor, ExtractError, FaceRegion};
use crate::recognizer::FaceRecognizer;
use crate::types::Embedding;
use image::{DynamicImage, RgbImage};
use std::path::Path;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    /// Faces scored below this by the detector are not embedded.
    min_confidence: f32,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`. Fails if either file is missing.
    pub fn load(model_dir: &Path, min_confidence: f32) -> Result<Self, ExtractError> {
        let path = |file: &str| model_dir.join(file).to_string_lossy().into_owned();
        let detector = FaceDetector::load(&path(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&path(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
            min_confidence,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, ExtractError> {
        let rgb = image.to_rgb8();
        let boxes = self.detector.detect(&rgb)?;
        Ok(boxes
            .into_iter()
            .map(|bbox| FaceRegion {
                crop: bbox.landmarks.as_ref().map(|lms| alignment::align_face(&rgb, lms)),
                bbox,
            })
            .collect())
    }

    fn embed(&mut self, face: &FaceRegion) -> Result<Option<Embedding>, ExtractError> {
        match embeddable_crop(face, self.min_confidence) {
            Some(crop) => self.recognizer.embed(crop).map(Some),
            None => Ok(None),
        }
    }
}

/// The aligned crop to embed, or `None` when the face is too weak a
/// detection or had no landmarks to align with.
fn embeddable_crop(face: &FaceRegion, min_confidence: f32) -> Option<&RgbImage> {
    if face.bbox.confidence < min_confidence {
        tracing::debug!(
            confidence = face.bbox.confidence,
            min = min_confidence,
            "face below detection confidence; not embedding"
        );
        return None;
    }
    if face.crop.is_none() {
        tracing::debug!("face has no landmarks; not embedding");
    }
    face.crop.as_ref()
}
