use std::path::{Path, PathBuf};

use rollcall_core::decision::Cutoff;
use rollcall_core::liveness::LivenessMode;
use rollcall_core::tracker::TrackerConfig;
use rollcall_core::SessionConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key}: invalid value {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be within [0, 1], got {value}")]
    OutOfRange { key: &'static str, value: f32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Daemon configuration.
///
/// Layered as defaults, then the TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum spacing between admitted frames (default 100 ms, 10 fps).
    pub frame_interval_ms: u64,
    /// Seed for challenge selection; random when unset.
    pub rng_seed: Option<u64>,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("rollcall.db"),
            frame_interval_ms: 100,
            rng_seed: None,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let var = |key: &str| std::env::var(key).ok();
        let mut config = match var("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(var)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable numbers keep the current value.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.frame_interval_ms = env_u64(&var, "ROLLCALL_FRAME_INTERVAL_MS", self.frame_interval_ms);
        if let Some(seed) = var("ROLLCALL_RNG_SEED").and_then(|v| v.parse().ok()) {
            self.rng_seed = Some(seed);
        }

        let session = &mut self.session;

        let repo = &mut session.repository;
        repo.max_descriptors_per_identity =
            env_usize(&var, "ROLLCALL_MAX_DESCRIPTORS_PER_USER", repo.max_descriptors_per_identity);
        repo.min_confidence_to_learn =
            env_f32(&var, "ROLLCALL_MIN_CONFIDENCE_TO_LEARN", repo.min_confidence_to_learn);

        let matcher = &mut session.matcher;
        matcher.match_threshold = env_f32(&var, "ROLLCALL_MATCH_THRESHOLD", matcher.match_threshold);
        matcher.accept_threshold = env_f32(&var, "ROLLCALL_ACCEPT_THRESHOLD", matcher.accept_threshold);

        let tracker = &mut session.tracker;
        if var("ROLLCALL_CLASSROOM").is_some_and(|v| v != "0") {
            // Cadence only; association settings from the file are kept.
            let classroom = TrackerConfig::classroom();
            tracker.max_faces = classroom.max_faces;
            tracker.recognize_every = classroom.recognize_every;
        }
        tracker.max_faces = env_usize(&var, "ROLLCALL_MAX_FACES", tracker.max_faces);
        let max_misses = env_u64(&var, "ROLLCALL_MAX_MISSES", tracker.max_misses.into());
        tracker.max_misses = u32::try_from(max_misses).map_err(|_| ConfigError::InvalidValue {
            key: "ROLLCALL_MAX_MISSES",
            value: max_misses.to_string(),
        })?;

        let liveness = &mut session.liveness;
        if let Some(mode) = var("ROLLCALL_LIVENESS_MODE") {
            liveness.mode = match mode.as_str() {
                "passive" => LivenessMode::Passive,
                "challenge" => LivenessMode::Challenge,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ROLLCALL_LIVENESS_MODE",
                        value: mode,
                    })
                }
            };
        }
        liveness.composite_threshold =
            env_f32(&var, "ROLLCALL_LIVENESS_THRESHOLD", liveness.composite_threshold);
        liveness.texture.spoof_threshold =
            env_f32(&var, "ROLLCALL_TEXTURE_SPOOF_THRESHOLD", liveness.texture.spoof_threshold);

        if let Some(cutoff) = var("ROLLCALL_CUTOFF") {
            session.decision.cutoff = cutoff.parse::<Cutoff>().map_err(|_| ConfigError::InvalidValue {
                key: "ROLLCALL_CUTOFF",
                value: cutoff,
            })?;
        }
        if let Some(v) = var("ROLLCALL_REJECT_ON_TEXTURE_SPOOF") {
            session.decision.reject_on_texture_spoof = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        let unit = [
            ("repository.min_confidence_to_learn", s.repository.min_confidence_to_learn),
            ("matcher.match_threshold", s.matcher.match_threshold),
            ("matcher.accept_threshold", s.matcher.accept_threshold),
            ("liveness.composite_threshold", s.liveness.composite_threshold),
            ("liveness.passive_weight", s.liveness.passive_weight),
            ("liveness.challenge_weight", s.liveness.challenge_weight),
            ("liveness.texture.spoof_threshold", s.liveness.texture.spoof_threshold),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { key, value });
            }
        }

        let counts = [
            ("repository.max_descriptors_per_identity", s.repository.max_descriptors_per_identity),
            ("repository.descriptor_dim", s.repository.descriptor_dim),
            ("matcher.ensemble_size", s.matcher.ensemble_size),
            ("tracker.max_faces", s.tracker.max_faces),
            ("tracker.recognize_every", s.tracker.recognize_every as usize),
            ("liveness.crop_size", s.liveness.crop_size),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(key));
            }
        }
        if self.frame_interval_ms == 0 {
            return Err(ConfigError::Zero("frame_interval_ms"));
        }
        s.liveness
            .plan
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                key: "liveness.plan",
                value: e.to_string(),
            })
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_f32<F: Fn(&str) -> Option<String>>(var: &F, key: &str, default: f32) -> f32 {
    parse_or(var, key, default)
}

fn env_u64<F: Fn(&str) -> Option<String>>(var: &F, key: &str, default: u64) -> u64 {
    parse_or(var, key, default)
}

fn env_usize<F: Fn(&str) -> Option<String>>(var: &F, key: &str, default: usize) -> usize {
    parse_or(var, key, default)
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.frame_interval_ms, 100);
        assert_eq!(config.session.repository.max_descriptors_per_identity, 20);
        assert_eq!(config.session.tracker.max_faces, 5);
        assert!((config.session.matcher.accept_threshold - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_toml_layer() {
        let config = Config::from_toml(
            r#"
            db_path = "/srv/rollcall/att.db"
            frame_interval_ms = 200

            [session.matcher]
            accept_threshold = 0.35

            [session.decision]
            cutoff = "08:30"

            [session.liveness]
            mode = "challenge"
            plan = { type = "sequence", kinds = ["blink", "turnLeft"] }
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/srv/rollcall/att.db"));
        assert_eq!(config.frame_interval_ms, 200);
        assert!((config.session.matcher.accept_threshold - 0.35).abs() < 1e-6);
        // Untouched fields keep their defaults.
        assert!((config.session.matcher.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.session.decision.cutoff.to_string(), "08:30");
        assert_eq!(config.session.liveness.mode, LivenessMode::Challenge);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("ROLLCALL_DB_PATH", "/tmp/x.db"),
                ("ROLLCALL_ACCEPT_THRESHOLD", "0.3"),
                ("ROLLCALL_MAX_DESCRIPTORS_PER_USER", "not-a-number"),
                ("ROLLCALL_CUTOFF", "09:45"),
                ("ROLLCALL_LIVENESS_MODE", "challenge"),
            ]))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert!((config.session.matcher.accept_threshold - 0.3).abs() < 1e-6);
        assert_eq!(config.session.repository.max_descriptors_per_identity, 20);
        assert_eq!(config.session.decision.cutoff.to_string(), "09:45");
        assert_eq!(config.session.liveness.mode, LivenessMode::Challenge);
    }

    #[test]
    fn test_classroom_mode() {
        let mut config = Config::default();
        config.apply_env(env(&[("ROLLCALL_CLASSROOM", "1")])).unwrap();
        assert_eq!(config.session.tracker.max_faces, 60);
        assert_eq!(config.session.tracker.recognize_every, 3);
    }

    #[test]
    fn test_classroom_keeps_file_tracker_settings() {
        let mut config = Config::from_toml(
            r#"
            [session.tracker]
            max_displacement = 42.0
            max_misses = 9
            "#,
        )
        .unwrap();
        config.apply_env(env(&[("ROLLCALL_CLASSROOM", "1")])).unwrap();
        let tracker = &config.session.tracker;
        assert_eq!(tracker.max_faces, 60);
        assert_eq!(tracker.recognize_every, 3);
        assert_eq!(tracker.max_displacement, 42.0);
        assert_eq!(tracker.max_misses, 9);
    }

    #[test]
    fn test_max_misses_out_of_range_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("ROLLCALL_MAX_MISSES", "4294967296")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ROLLCALL_MAX_MISSES", .. }));

        let mut config = Config::default();
        config.apply_env(env(&[("ROLLCALL_MAX_MISSES", "12")])).unwrap();
        assert_eq!(config.session.tracker.max_misses, 12);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("ROLLCALL_CUTOFF", "25:99")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ROLLCALL_CUTOFF", .. }));

        let mut config = Config::default();
        config.session.matcher.accept_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { key: "matcher.accept_threshold", .. })
        ));

        let mut config = Config::default();
        config.session.repository.max_descriptors_per_identity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }
}
