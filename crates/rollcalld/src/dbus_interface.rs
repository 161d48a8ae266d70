use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use rollcall_core::ServiceError;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    engine: EngineHandle,
    config: Config,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Recognize faces in the image at `path`. Returns a JSON array.
    async fn recognize(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "recognize requested");
        let results = self
            .engine
            .recognize(PathBuf::from(path))
            .await
            .map_err(|e| to_fdo("recognize", e))?;
        to_json(&results)
    }

    /// Enroll `name` from one or more image paths. Returns a JSON report.
    async fn enroll(&self, name: &str, paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(name, images = paths.len(), "enroll requested");
        let paths = paths.into_iter().map(PathBuf::from).collect();
        let report = self
            .engine
            .enroll(name.to_string(), paths)
            .await
            .map_err(|e| to_fdo("enroll", e))?;
        to_json(&report)
    }

    /// List enrolled people with their embedding counts. Returns a JSON array.
    async fn list_people(&self) -> zbus::fdo::Result<String> {
        let people = self
            .engine
            .list_people()
            .await
            .map_err(|e| to_fdo("list_people", e))?;
        to_json(&people)
    }

    /// Remove a person. False when the name is not enrolled.
    async fn remove_person(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove_person requested");
        self.engine
            .remove_person(name.to_string())
            .await
            .map_err(|e| to_fdo("remove_person", e))
    }

    /// Remove everyone.
    async fn clear(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("clear requested");
        self.engine.clear().await.map_err(|e| to_fdo("clear", e))?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let stats = self.engine.stats().await.map_err(|e| to_fdo("status", e))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store_path": self.config.store_path,
            "model_dir": self.config.model_dir,
            "people": stats.people,
            "embeddings": stats.embeddings,
            "metric": self.config.metric,
            "threshold": self.config.threshold,
            "min_detection_confidence": self.config.min_detection_confidence,
        })
        .to_string())
    }
}

/// Log the full error, hand the client a short generic one.
fn to_fdo(op: &str, err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(op, error = %err, "request failed");
    match err {
        EngineError::Service(ServiceError::InvalidInput(msg)) => {
            zbus::fdo::Error::InvalidArgs(msg.to_string())
        }
        EngineError::Service(ServiceError::NoEmbeddings) => zbus::fdo::Error::Failed(
            "no face could be extracted; make sure faces are clearly visible".into(),
        ),
        EngineError::Image { path, .. } => {
            zbus::fdo::Error::InvalidArgs(format!("cannot read image {}", path.display()))
        }
        _ => zbus::fdo::Error::Failed(format!("{op} failed; see rollcalld log")),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}
