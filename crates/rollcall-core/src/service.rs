//! Recognition and enrollment: the extractor wired to the store and matcher.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::matcher::MatchEngine;
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{BoundingBox, Embedding};
use image::DynamicImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("no face embedding could be extracted from any image")]
    NoEmbeddings,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractError),
}

/// One recognized (or unrecognized) face in an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    /// Position of the face in detection order.
    pub face_index: usize,
    /// Matched identity; `None` is an unknown face.
    pub name: Option<String>,
    pub confidence: f32,
    /// Distance to the nearest stored embedding, if any was comparable.
    pub distance: Option<f32>,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

pub struct RecognitionService<E> {
    extractor: E,
    store: EmbeddingStore,
    engine: MatchEngine,
}

impl<E: EmbeddingExtractor> RecognitionService<E> {
    pub fn new(extractor: E, store: EmbeddingStore, engine: MatchEngine) -> Self {
        Self {
            extractor,
            store,
            engine,
        }
    }

    /// Detect every face in `image` and match each against the current store.
    ///
    /// Faces that yield no embedding are left out. An image without faces
    /// gives an empty list.
    pub fn recognize(&mut self, image: &DynamicImage) -> Result<Vec<Recognition>, ServiceError> {
        let faces = self.extractor.detect(image)?;
        if faces.is_empty() {
            tracing::info!("recognize: no faces detected");
            return Ok(Vec::new());
        }

        // Reloaded per call so enrollments and removals are always visible.
        let store = self.store.load();
        let mut results = Vec::with_capacity(faces.len());

        for (face_index, face) in faces.iter().enumerate() {
            let embedding = match self.extractor.embed(face) {
                Ok(Some(e)) => e,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(face_index, error = %e, "recognize: embedding failed; face skipped");
                    continue;
                }
            };

            let m = self.engine.find_match(&embedding, &store);
            tracing::debug!(
                face_index,
                name = m.name.as_deref().unwrap_or("unknown"),
                distance = ?m.distance,
                "recognize: face matched"
            );
            results.push(Recognition {
                face_index,
                name: m.name,
                confidence: m.confidence,
                distance: m.distance,
                bbox: face.bbox.clone(),
            });
        }

        tracing::info!(
            detected = faces.len(),
            embedded = results.len(),
            recognized = results.iter().filter(|r| r.name.is_some()).count(),
            "recognize complete"
        );
        Ok(results)
    }
}

/// Outcome of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollReport {
    pub name: String,
    /// Images that contributed an embedding.
    pub accepted: usize,
    /// Images skipped because no usable face was found.
    pub skipped: usize,
    /// Embeddings stored for `name` after this enrollment.
    pub total_embeddings: usize,
}

pub struct EnrollmentService<E> {
    extractor: E,
    store: EmbeddingStore,
}

impl<E: EmbeddingExtractor> EnrollmentService<E> {
    pub fn new(extractor: E, store: EmbeddingStore) -> Self {
        Self { extractor, store }
    }

    /// Extract the dominant face from each image and append the embeddings
    /// under `name`.
    ///
    /// Images without a usable face are skipped; the call fails only when
    /// none of them produced an embedding, in which case the store is not
    /// touched.
    pub fn enroll(&mut self, name: &str, images: &[DynamicImage]) -> Result<EnrollReport, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput("name must not be empty"));
        }
        if images.is_empty() {
            return Err(ServiceError::InvalidInput("at least one image is required"));
        }

        let mut embeddings: Vec<Embedding> = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            match self.extractor.dominant_embedding(image) {
                Ok(Some(e)) => embeddings.push(e),
                Ok(None) => tracing::warn!(name, index, "enroll: no usable face in image; skipped"),
                Err(e) => tracing::warn!(name, index, error = %e, "enroll: extraction failed; skipped"),
            }
        }

        if embeddings.is_empty() {
            tracing::warn!(name, images = images.len(), "enroll: nothing extracted; store untouched");
            return Err(ServiceError::NoEmbeddings);
        }

        let accepted = embeddings.len();
        let total_embeddings = self.store.try_add_embeddings(name, embeddings)?;
        Ok(EnrollReport {
            name: name.to_string(),
            accepted,
            skipped: images.len() - accepted,
            total_embeddings,
        })
    }

    /// Boolean form of [`enroll`](Self::enroll).
    pub fn enroll_ok(&mut self, name: &str, images: &[DynamicImage]) -> bool {
        match self.enroll(name, images) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(name, error = %e, "enroll failed");
                false
            }
        }
    }
}
