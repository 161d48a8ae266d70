//! Persistent name → embeddings store.
//!
//! The whole store is one JSON document, rewritten on every mutation via
//! temp-file + rename. Every operation reloads from disk; nothing is cached
//! between calls.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STORE_FORMAT: &str = "rollcall-store";
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store file not found: {0}")]
    NotFound(PathBuf),
    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store decode failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("store encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("store checksum mismatch (expected {expected}, computed {actual})")]
    Checksum { expected: String, actual: String },
    #[error("unsupported store format {format:?} version {version}")]
    UnsupportedFormat { format: String, version: u32 },
    #[error("person name must not be empty")]
    EmptyName,
    #[error("no embeddings to add")]
    NoEmbeddings,
    #[error("person not found: {0}")]
    PersonNotFound(String),
    #[error("embedding for {name} has a NaN or infinite component")]
    NonFinite { name: String },
}

/// In-memory view of the store: identity name → enrolled embeddings.
///
/// Backed by a `BTreeMap` so iteration (and therefore match tie-breaking)
/// is deterministic: names in lexicographic order, embeddings in append order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Store {
    people: BTreeMap<String, Vec<Embedding>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    /// Number of enrolled people.
    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.people.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&[Embedding]> {
        self.people.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.people.keys().map(String::as_str)
    }

    /// People with their embeddings, in name order.
    pub fn people(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.people.iter().map(|(n, e)| (n.as_str(), e.as_slice()))
    }

    /// Every (name, embedding) pair, in deterministic scan order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.people
            .iter()
            .flat_map(|(name, embs)| embs.iter().map(move |e| (name.as_str(), e)))
    }

    /// Total embeddings across all people.
    pub fn embedding_count(&self) -> usize {
        self.people.values().map(Vec::len).sum()
    }

    /// Append embeddings to `name`, creating the identity if needed.
    /// An empty list leaves the store untouched.
    pub fn append(&mut self, name: &str, embeddings: Vec<Embedding>) {
        if embeddings.is_empty() {
            return;
        }
        self.people
            .entry(name.to_string())
            .or_default()
            .extend(embeddings);
    }

    /// Remove `name`, returning its embeddings if it was present.
    pub fn remove(&mut self, name: &str) -> Option<Vec<Embedding>> {
        self.people.remove(name)
    }

    /// First person holding a NaN or infinite component, if any.
    /// JSON has no encoding for those, so such a store cannot be saved.
    fn first_non_finite(&self) -> Option<&str> {
        self.people()
            .find(|(_, embs)| !all_finite(embs))
            .map(|(name, _)| name)
    }

    /// Drop identities with zero embeddings. Returns how many were dropped.
    fn prune_empty(&mut self) -> usize {
        let before = self.people.len();
        self.people.retain(|_, embs| !embs.is_empty());
        before - self.people.len()
    }

    fn digest(&self) -> Result<String, StoreError> {
        let payload = serde_json::to_vec(self).map_err(StoreError::Encode)?;
        Ok(hex(&Sha256::digest(&payload)))
    }
}

/// On-disk envelope around the store payload.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    format: String,
    version: u32,
    /// SHA-256 (hex) of the compact JSON encoding of `people`.
    checksum: String,
    people: Store,
}

/// Handle to the store file. Cheap to clone; holds no state besides the path.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    path: PathBuf,
}

impl EmbeddingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the store file.
    pub fn try_load(&self) -> Result<Store, StoreError> {
        let bytes = fs::read(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(self.path.clone())
            } else {
                StoreError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;

        let file: StoreFile = serde_json::from_slice(&bytes).map_err(StoreError::Decode)?;
        if file.format != STORE_FORMAT || file.version != STORE_VERSION {
            return Err(StoreError::UnsupportedFormat {
                format: file.format,
                version: file.version,
            });
        }

        let actual = file.people.digest()?;
        if actual != file.checksum {
            return Err(StoreError::Checksum {
                expected: file.checksum,
                actual,
            });
        }

        let mut store = file.people;
        let pruned = store.prune_empty();
        if pruned > 0 {
            tracing::warn!(pruned, "store contained people with no embeddings; dropped");
        }
        Ok(store)
    }

    /// Load the store, degrading to an empty store when the file is missing
    /// or unreadable.
    ///
    /// A corrupt file is not repaired here; the next successful save replaces it.
    pub fn load(&self) -> Store {
        match self.try_load() {
            Ok(store) => store,
            Err(StoreError::NotFound(path)) => {
                tracing::debug!(path = %path.display(), "no store file yet; starting empty");
                Store::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "store unreadable; treating as empty"
                );
                Store::new()
            }
        }
    }

    /// Serialize the full store and atomically replace the file.
    ///
    /// Parent directories are created on first save.
    pub fn try_save(&self, store: &Store) -> Result<(), StoreError> {
        if let Some(name) = store.first_non_finite() {
            return Err(StoreError::NonFinite {
                name: name.to_string(),
            });
        }
        let io_err = |source: io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let file = StoreFile {
            format: STORE_FORMAT.to_string(),
            version: STORE_VERSION,
            checksum: store.digest()?,
            people: store.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(io_err)?;
            f.write_all(&bytes).map_err(io_err)?;
            f.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        tracing::debug!(
            path = %self.path.display(),
            people = store.len(),
            embeddings = store.embedding_count(),
            "store saved"
        );
        Ok(())
    }

    /// Boolean form of [`try_save`](Self::try_save); failures are logged.
    pub fn save(&self, store: &Store) -> bool {
        log_failure("save", self.try_save(store)).is_some()
    }

    /// Append embeddings under `name`. Returns the person's new embedding count.
    pub fn try_add_embeddings(
        &self,
        name: &str,
        embeddings: Vec<Embedding>,
    ) -> Result<usize, StoreError> {
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings);
        }
        if !all_finite(&embeddings) {
            return Err(StoreError::NonFinite {
                name: name.to_string(),
            });
        }

        let added = embeddings.len();
        let mut store = self.load();
        store.append(name, embeddings);
        self.try_save(&store)?;

        let total = store.get(name).map_or(0, <[Embedding]>::len);
        tracing::info!(name, added, total, "embeddings added");
        Ok(total)
    }

    pub fn add_embeddings(&self, name: &str, embeddings: Vec<Embedding>) -> bool {
        log_failure("add_embeddings", self.try_add_embeddings(name, embeddings)).is_some()
    }

    /// Remove a person. The file is not rewritten when the name is absent.
    /// Returns how many embeddings were removed.
    pub fn try_remove_person(&self, name: &str) -> Result<usize, StoreError> {
        let mut store = self.load();
        let removed = store
            .remove(name)
            .ok_or_else(|| StoreError::PersonNotFound(name.to_string()))?;
        self.try_save(&store)?;
        tracing::info!(name, embeddings = removed.len(), "person removed");
        Ok(removed.len())
    }

    pub fn remove_person(&self, name: &str) -> bool {
        log_failure("remove_person", self.try_remove_person(name)).is_some()
    }

    pub fn try_clear(&self) -> Result<(), StoreError> {
        self.try_save(&Store::new())?;
        tracing::info!(path = %self.path.display(), "store cleared");
        Ok(())
    }

    pub fn clear(&self) -> bool {
        log_failure("clear", self.try_clear()).is_some()
    }

    pub fn get_all(&self) -> Store {
        self.load()
    }

    pub fn get_embeddings_for(&self, name: &str) -> Vec<Embedding> {
        self.load().remove(name).unwrap_or_default()
    }
}

fn log_failure<T>(op: &str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(op, error = %e, "store operation failed");
            None
        }
    }
}

fn all_finite(embeddings: &[Embedding]) -> bool {
    embeddings
        .iter()
        .all(|e| e.values.iter().all(|v| v.is_finite()))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn store_in(dir: &tempfile::TempDir) -> EmbeddingStore {
        EmbeddingStore::new(dir.path().join("models").join("faces.json"))
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(store.try_load(), Err(StoreError::NotFound(_))));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_first_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0, 0.0])]));
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_add_then_get_preserves_append_order() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        assert!(store.add_embeddings("alice", vec![emb(&[1.0]), emb(&[2.0])]));
        assert!(store.add_embeddings("bob", vec![emb(&[9.0])]));
        assert!(store.add_embeddings("alice", vec![emb(&[3.0])]));

        assert_eq!(
            store.get_embeddings_for("alice"),
            vec![emb(&[1.0]), emb(&[2.0]), emb(&[3.0])]
        );
        assert_eq!(store.get_embeddings_for("bob"), vec![emb(&[9.0])]);
        assert!(store.get_embeddings_for("carol").is_empty());
    }

    #[test]
    fn test_add_empty_list_rejected_without_write() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(
            store.try_add_embeddings("alice", vec![]),
            Err(StoreError::NoEmbeddings)
        ));
        assert!(!store.add_embeddings("alice", vec![]));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_add_empty_name_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(matches!(
            store.try_add_embeddings("", vec![emb(&[1.0])]),
            Err(StoreError::EmptyName)
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_remove_absent_person_leaves_store_unchanged() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0, 2.0])]));
        let before = fs::read(store.path()).unwrap();

        assert!(!store.remove_person("mallory"));
        assert!(matches!(
            store.try_remove_person("mallory"),
            Err(StoreError::PersonNotFound(n)) if n == "mallory"
        ));
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_remove_absent_person_on_missing_store_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.remove_person("alice"));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_remove_present_person() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0]), emb(&[2.0])]));
        assert!(store.add_embeddings("bob", vec![emb(&[3.0])]));

        assert_eq!(store.try_remove_person("alice").unwrap(), 2);
        let all = store.get_all();
        assert!(!all.contains("alice"));
        assert!(all.contains("bob"));
    }

    #[test]
    fn test_clear_then_get_all_is_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0])]));
        assert!(store.clear());
        assert!(store.get_all().is_empty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_resave_is_byte_stable() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("zoe", vec![emb(&[0.1, -0.25, 3.5e-4])]));
        assert!(store.add_embeddings("adam", vec![emb(&[1.0 / 3.0, 2.0 / 7.0, 0.0])]));
        let first = fs::read(store.path()).unwrap();

        let loaded = store.try_load().unwrap();
        assert!(store.save(&loaded));
        assert_eq!(fs::read(store.path()).unwrap(), first);
    }

    #[test]
    fn test_non_finite_embedding_refused_and_roster_kept() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0, 0.0])]));
        let before = fs::read(store.path()).unwrap();

        assert!(matches!(
            store.try_add_embeddings("bob", vec![emb(&[f32::NAN, 0.0])]),
            Err(StoreError::NonFinite { name }) if name == "bob"
        ));
        assert!(!store.add_embeddings("bob", vec![emb(&[0.0, f32::INFINITY])]));
        assert_eq!(fs::read(store.path()).unwrap(), before);

        assert!(store.add_embeddings("carol", vec![emb(&[0.0, 1.0])]));
        let loaded = store.try_load().unwrap();
        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["alice", "carol"]);
    }

    #[test]
    fn test_save_refuses_store_with_non_finite_values() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[1.0, 0.0])]));

        let mut poisoned = store.try_load().unwrap();
        poisoned.append("bob", vec![emb(&[f32::NEG_INFINITY, 0.0])]);
        assert!(!store.save(&poisoned));
        assert!(matches!(
            store.try_save(&poisoned),
            Err(StoreError::NonFinite { name }) if name == "bob"
        ));
        assert!(store.try_load().unwrap().contains("alice"));
    }

    #[test]
    fn test_model_version_survives_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let e = Embedding {
            values: vec![0.5, 0.5],
            model_version: Some("w600k_r50".into()),
        };
        assert!(store.add_embeddings("alice", vec![e.clone()]));
        assert_eq!(store.get_embeddings_for("alice"), vec![e]);
    }

    #[test]
    fn test_garbage_file_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"\x80\x04not json").unwrap();

        assert!(matches!(store.try_load(), Err(StoreError::Decode(_))));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.add_embeddings("alice", vec![emb(&[0.25, 0.5])]));

        let text = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), text.replace("0.25", "0.75")).unwrap();

        assert!(matches!(store.try_load(), Err(StoreError::Checksum { .. })));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let payload = Store::new();
        let file = StoreFile {
            format: STORE_FORMAT.into(),
            version: STORE_VERSION + 1,
            checksum: payload.digest().unwrap(),
            people: payload,
        };
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), serde_json::to_vec(&file).unwrap()).unwrap();

        assert!(matches!(
            store.try_load(),
            Err(StoreError::UnsupportedFormat { version: 2, .. })
        ));
    }

    #[test]
    fn test_empty_identity_pruned_on_load() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut people = BTreeMap::new();
        people.insert("ghost".to_string(), Vec::new());
        people.insert("alice".to_string(), vec![emb(&[1.0])]);
        let payload = Store { people };
        let file = StoreFile {
            format: STORE_FORMAT.into(),
            version: STORE_VERSION,
            checksum: payload.digest().unwrap(),
            people: payload,
        };
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), serde_json::to_vec(&file).unwrap()).unwrap();

        let loaded = store.try_load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded.contains("ghost"));
    }

    #[test]
    fn test_entries_scan_order() {
        let mut s = Store::new();
        s.append("bob", vec![emb(&[2.0]), emb(&[3.0])]);
        s.append("alice", vec![emb(&[1.0])]);
        s.append("carol", vec![]);

        let order: Vec<(&str, f32)> = s.entries().map(|(n, e)| (n, e.values[0])).collect();
        assert_eq!(order, vec![("alice", 1.0), ("bob", 2.0), ("bob", 3.0)]);
        assert_eq!(s.embedding_count(), 3);
        assert!(!s.contains("carol"));
    }
}
