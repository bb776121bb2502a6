use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use veriface_core::{EngineConfig, MatchMetric};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Root of the descriptor store.
    pub store_dir: PathBuf,
    /// Timeout in seconds for one verify, enroll or frame-sequence call.
    pub verify_timeout_secs: u64,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Engine thresholds, from `VERIFACE_CONFIG` when set.
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from `VERIFACE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model_dir = get("VERIFACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(veriface_core::default_model_dir);
        let store_dir = get("VERIFACE_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(veriface_core::default_store_dir);

        let mut engine = match get("VERIFACE_CONFIG") {
            Some(path) => load_engine_config(PathBuf::from(path))?,
            None => EngineConfig::default(),
        };
        if let Some(threshold) = parse(&get, "VERIFACE_SIMILARITY_THRESHOLD") {
            engine.match_metric = MatchMetric::Cosine { threshold };
        }

        Ok(Self {
            model_dir,
            store_dir,
            verify_timeout_secs: parse(&get, "VERIFACE_VERIFY_TIMEOUT_SECS").unwrap_or(10),
            system_bus: get("VERIFACE_SYSTEM_BUS").is_some_and(|v| v != "0"),
            engine,
        })
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.parse().ok())
}

fn load_engine_config(path: PathBuf) -> Result<EngineConfig, ConfigError> {
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    parse_engine_config(&text).map_err(|source| ConfigError::Parse { path, source })
}

/// Parse a TOML engine table. Missing keys keep their defaults.
pub fn parse_engine_config(text: &str) -> Result<EngineConfig, toml::de::Error> {
    toml::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.verify_timeout_secs, 10);
        assert!(!config.system_bus);
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.store_dir.ends_with("veriface/faces"));
        assert!(config.model_dir.ends_with("veriface/models"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VERIFACE_MODEL_DIR", "/opt/models"),
            ("VERIFACE_STORE_DIR", "/var/lib/veriface"),
            ("VERIFACE_VERIFY_TIMEOUT_SECS", "3"),
            ("VERIFACE_SYSTEM_BUS", "1"),
            ("VERIFACE_SIMILARITY_THRESHOLD", "0.9"),
        ]))
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/veriface"));
        assert_eq!(config.verify_timeout(), Duration::from_secs(3));
        assert!(config.system_bus);
        assert_eq!(config.engine.match_metric, MatchMetric::Cosine { threshold: 0.9 });
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("VERIFACE_VERIFY_TIMEOUT_SECS", "soon"),
            ("VERIFACE_SYSTEM_BUS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.verify_timeout_secs, 10);
        assert!(!config.system_bus);
    }

    #[test]
    fn test_partial_engine_table() {
        let engine = parse_engine_config(
            r#"
            strong_match_confidence = 95.0
            max_video_frames = 30

            [match_metric]
            kind = "distance"
            max_distance = 0.3
            "#,
        )
        .unwrap();
        assert_eq!(engine.strong_match_confidence, 95.0);
        assert_eq!(engine.max_video_frames, 30);
        assert_eq!(engine.match_metric, MatchMetric::Distance { max_distance: 0.3 });
        assert_eq!(engine.video_min_success_rate, EngineConfig::default().video_min_success_rate);
    }

    #[test]
    fn test_config_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = Config::from_lookup(lookup(&[("VERIFACE_CONFIG", missing.to_str().unwrap())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "strong_match_confidence = \"high\"").unwrap();
        let err =
            Config::from_lookup(lookup(&[("VERIFACE_CONFIG", bad.to_str().unwrap())])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "video_frame_interval = 3\n").unwrap();
        let config =
            Config::from_lookup(lookup(&[("VERIFACE_CONFIG", path.to_str().unwrap())])).unwrap();
        assert_eq!(config.engine.video_frame_interval, 3);
    }
}
