//! Engine thread: sole owner of the extractor and sole writer of the store.
//!
//! Every request from the D-Bus side is queued onto one OS thread and
//! handled to completion before the next, so concurrent enrollments can
//! never interleave their read-modify-write of the store file.

use image::DynamicImage;
use rollcall_core::{
    EmbeddingExtractor, EmbeddingStore, EnrollReport, EnrollmentService, MatchEngine, Recognition,
    RecognitionService, ServiceError, StoreError,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Service(#[from] ServiceError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("cannot read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One enrolled person as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub name: String,
    pub embeddings: usize,
}

/// Store totals for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StoreStats {
    pub people: usize,
    pub embeddings: usize,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<Recognition>, EngineError>>,
    },
    Enroll {
        name: String,
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<EnrollReport, EngineError>>,
    },
    ListPeople {
        reply: oneshot::Sender<Vec<PersonSummary>>,
    },
    RemovePerson {
        name: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Recognize every face in the image at `path`.
    pub async fn recognize(&self, path: PathBuf) -> Result<Vec<Recognition>, EngineError> {
        self.call(|reply| EngineRequest::Recognize { path, reply }).await?
    }

    /// Enroll `name` from the images at `paths`.
    pub async fn enroll(&self, name: String, paths: Vec<PathBuf>) -> Result<EnrollReport, EngineError> {
        self.call(|reply| EngineRequest::Enroll { name, paths, reply }).await?
    }

    pub async fn list_people(&self) -> Result<Vec<PersonSummary>, EngineError> {
        self.call(|reply| EngineRequest::ListPeople { reply }).await
    }

    /// Remove a person. `Ok(false)` when no such person is enrolled.
    pub async fn remove_person(&self, name: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::RemovePerson { name, reply }).await?
    }

    pub async fn clear(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Clear { reply }).await?
    }

    pub async fn stats(&self) -> Result<StoreStats, EngineError> {
        self.call(|reply| EngineRequest::Stats { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The extractor is moved onto the thread; models should already be
/// loaded so startup fails before any client connects.
pub fn spawn_engine<E>(
    extractor: E,
    store: EmbeddingStore,
    matcher: MatchEngine,
) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let mut worker = Worker {
                extractor,
                store,
                matcher,
            };
            tracing::info!(store = %worker.store.path().display(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Worker<E> {
    extractor: E,
    store: EmbeddingStore,
    matcher: MatchEngine,
}

impl<E: EmbeddingExtractor> Worker<E> {
    fn handle(&mut self, req: EngineRequest) {
        // A dropped receiver means the client went away; nothing to do.
        match req {
            EngineRequest::Recognize { path, reply } => {
                let _ = reply.send(self.recognize(path));
            }
            EngineRequest::Enroll { name, paths, reply } => {
                let _ = reply.send(self.enroll(&name, &paths));
            }
            EngineRequest::ListPeople { reply } => {
                let people = self
                    .store
                    .get_all()
                    .people()
                    .map(|(name, embs)| PersonSummary {
                        name: name.to_string(),
                        embeddings: embs.len(),
                    })
                    .collect();
                let _ = reply.send(people);
            }
            EngineRequest::RemovePerson { name, reply } => {
                let result = match self.store.try_remove_person(&name) {
                    Ok(_) => Ok(true),
                    Err(StoreError::PersonNotFound(_)) => Ok(false),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            EngineRequest::Clear { reply } => {
                let _ = reply.send(self.store.try_clear().map_err(EngineError::from));
            }
            EngineRequest::Stats { reply } => {
                let store = self.store.get_all();
                let _ = reply.send(StoreStats {
                    people: store.len(),
                    embeddings: store.embedding_count(),
                });
            }
        }
    }

    fn recognize(&mut self, path: PathBuf) -> Result<Vec<Recognition>, EngineError> {
        let image = open_image(path)?;
        let mut service = RecognitionService::new(&mut self.extractor, self.store.clone(), self.matcher);
        Ok(service.recognize(&image)?)
    }

    fn enroll(&mut self, name: &str, paths: &[PathBuf]) -> Result<EnrollReport, EngineError> {
        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            match open_image(path.clone()) {
                Ok(img) => images.push(img),
                Err(e) => tracing::warn!(name, error = %e, "enroll: image skipped"),
            }
        }
        let unreadable = paths.len() - images.len();

        // Every path was given but none decoded: same outcome as no faces.
        if images.is_empty() && !paths.is_empty() && !name.trim().is_empty() {
            return Err(ServiceError::NoEmbeddings.into());
        }

        let mut service = EnrollmentService::new(&mut self.extractor, self.store.clone());
        let mut report = service.enroll(name, &images)?;
        report.skipped += unreadable;
        Ok(report)
    }
}

fn open_image(path: PathBuf) -> Result<DynamicImage, EngineError> {
    image::open(&path).map_err(|source| EngineError::Image { path, source })
}
