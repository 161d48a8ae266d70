use rollcall_core::Metric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_THRESHOLD: f32 = 0.60;
const DEFAULT_MIN_DETECTION_CONFIDENCE: f32 = 0.60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional `config.toml`; any key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    store_path: Option<PathBuf>,
    metric: Option<Metric>,
    threshold: Option<f32>,
    min_detection_confidence: Option<f32>,
}

/// Daemon configuration: config file, then `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the JSON face store.
    pub store_path: PathBuf,
    /// Distance metric for matching.
    pub metric: Metric,
    /// Maximum distance accepted as a match, in [0, 1].
    pub threshold: f32,
    /// Faces the detector scores below this are not embedded.
    pub min_detection_confidence: f32,
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (or `$XDG_CONFIG_HOME/rollcall/config.toml`
    /// when present) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let path = env("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir(&env).join("config.toml"));

        let file = if path.exists() {
            tracing::info!(path = %path.display(), "reading config file");
            read_file(&path)?
        } else {
            FileConfig::default()
        };
        Ok(Self::from_sources(file, env))
    }

    fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir(&env);

        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));
        let store_path = env("ROLLCALL_STORE_PATH")
            .map(PathBuf::from)
            .or(file.store_path)
            .unwrap_or_else(|| data_dir.join("faces.json"));

        let metric = match env("ROLLCALL_METRIC").map(|v| v.parse::<Metric>()) {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring ROLLCALL_METRIC");
                file.metric.unwrap_or_default()
            }
            None => file.metric.unwrap_or_default(),
        };

        let threshold = unit_interval(
            "threshold",
            env_parse(&env, "ROLLCALL_THRESHOLD").or(file.threshold),
            DEFAULT_THRESHOLD,
        );
        let min_detection_confidence = unit_interval(
            "min_detection_confidence",
            env_parse(&env, "ROLLCALL_MIN_DETECTION_CONFIDENCE").or(file.min_detection_confidence),
            DEFAULT_MIN_DETECTION_CONFIDENCE,
        );

        Self {
            model_dir,
            store_path,
            metric,
            threshold,
            min_detection_confidence,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn home(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    PathBuf::from(env("HOME").unwrap_or_else(|| "/tmp".to_string()))
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".local/share"))
        .join("rollcall")
}

fn config_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home(env).join(".config"))
        .join("rollcall")
}

fn env_parse(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "not a number; ignoring");
            None
        }
    }
}

/// Keep a setting inside [0, 1]; non-finite values fall back to `default`.
fn unit_interval(key: &str, value: Option<f32>, default: f32) -> f32 {
    match value {
        None => default,
        Some(v) if !v.is_finite() => {
            tracing::warn!(key, value = v, default, "not finite; using default");
            default
        }
        Some(v) if !(0.0..=1.0).contains(&v) => {
            let clamped = v.clamp(0.0, 1.0);
            tracing::warn!(key, value = v, clamped, "out of [0, 1]; clamped");
            clamped
        }
        Some(v) => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_follow_xdg() {
        let cfg = Config::from_sources(FileConfig::default(), env_of(&[("HOME", "/home/ana")]));
        assert_eq!(cfg.store_path, PathBuf::from("/home/ana/.local/share/rollcall/faces.json"));
        assert_eq!(cfg.model_dir, PathBuf::from("/home/ana/.local/share/rollcall/models"));
        assert_eq!(cfg.metric, Metric::Cosine);
        assert_eq!(cfg.threshold, DEFAULT_THRESHOLD);
        assert_eq!(cfg.min_detection_confidence, DEFAULT_MIN_DETECTION_CONFIDENCE);

        let cfg = Config::from_sources(FileConfig::default(), env_of(&[("XDG_DATA_HOME", "/data")]));
        assert_eq!(cfg.store_path, PathBuf::from("/data/rollcall/faces.json"));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            store_path = "/srv/faces.json"
            metric = "euclidean"
            threshold = 0.5
            "#,
        )
        .unwrap();
        let cfg = Config::from_sources(
            file,
            env_of(&[("ROLLCALL_THRESHOLD", "0.3"), ("ROLLCALL_MODEL_DIR", "/opt/models")]),
        );
        assert_eq!(cfg.store_path, PathBuf::from("/srv/faces.json"));
        assert_eq!(cfg.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.metric, Metric::Euclidean);
        assert_eq!(cfg.threshold, 0.3);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = Config::from_sources(
            FileConfig::default(),
            env_of(&[
                ("ROLLCALL_METRIC", "hamming"),
                ("ROLLCALL_THRESHOLD", "lots"),
                ("ROLLCALL_MIN_DETECTION_CONFIDENCE", "1.5"),
            ]),
        );
        assert_eq!(cfg.metric, Metric::Cosine);
        assert_eq!(cfg.threshold, DEFAULT_THRESHOLD);
        assert_eq!(cfg.min_detection_confidence, 1.0);
    }

    #[test]
    fn test_euclidean_threshold_clamped_to_unit_interval() {
        let cfg = Config::from_sources(
            FileConfig::default(),
            env_of(&[("ROLLCALL_METRIC", "euclidean"), ("ROLLCALL_THRESHOLD", "1.4")]),
        );
        assert_eq!(cfg.metric, Metric::Euclidean);
        assert_eq!(cfg.threshold, 1.0);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "treshold = 0.4\n").unwrap();
        assert!(matches!(read_file(&path), Err(ConfigError::Parse { .. })));
    }
}
