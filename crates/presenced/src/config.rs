use presence_core::matcher::DEFAULT_MATCH_THRESHOLD;
use presence_core::{GeofencePolicy, LocalizerConfig, QualityConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config file {path}: {reason}")]
    Invalid {
        path: String,
        reason: String,
    },
}

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quality: QualityConfig,
    pub detection: LocalizerConfig,
    /// Cosine similarity threshold for a positive match.
    pub match_threshold: f32,
    pub geofence: GeofencePolicy,
    /// Directory containing the detector and recognizer model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults(&|key| std::env::var(key).ok())
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(&|key| std::env::var(key).ok())
    }

    /// Resolve every layer through `env`, so tests can supply their own.
    pub fn from_sources(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match env("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path), env)?,
            None => Self::defaults(env),
        };
        config.apply_env(env);
        Ok(config)
    }

    fn from_file(path: &Path, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config = Self::from_toml(&text, env).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        config
            .validate()
            .map_err(|reason| ConfigError::Invalid { path: display, reason })?;
        Ok(config)
    }

    /// Parse a TOML document; keys it leaves out keep their defaults.
    fn from_toml(text: &str, env: &dyn Fn(&str) -> Option<String>) -> Result<Self, toml::de::Error> {
        // Missing path keys would otherwise default against the real
        // environment rather than `env`.
        let defaults = Self::defaults(env);
        let mut config: Self = toml::from_str(text)?;
        let table: toml::Table = toml::from_str(text)?;
        if !table.contains_key("model_dir") {
            config.model_dir = defaults.model_dir;
        }
        if !table.contains_key("db_path") {
            config.db_path = defaults.db_path;
        }
        Ok(config)
    }

    fn defaults(env: &dyn Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir(env);
        Self {
            quality: QualityConfig::default(),
            detection: LocalizerConfig::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            geofence: GeofencePolicy::default(),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            bus: BusKind::Session,
        }
    }

    /// Override individual values from `PRESENCE_*` variables.
    /// Unparseable or out-of-range values leave the previous layer's value
    /// in place.
    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        self.override_with(env, "PRESENCE_BRIGHTNESS_MAX", |c| &mut c.quality.brightness_max);
        self.override_with(env, "PRESENCE_BRIGHTNESS_MIN", |c| &mut c.quality.brightness_min);
        self.override_with(env, "PRESENCE_BLUR_THRESHOLD", |c| &mut c.quality.blur_threshold);
        self.override_with(env, "PRESENCE_CONTRAST_MIN", |c| &mut c.quality.contrast_min);
        self.override_with(env, "PRESENCE_DETECTION_CONFIDENCE", |c| {
            &mut c.detection.confidence_threshold
        });
        self.override_with(env, "PRESENCE_CROP_MARGIN", |c| &mut c.detection.crop_margin);
        self.override_with(env, "PRESENCE_MATCH_THRESHOLD", |c| &mut c.match_threshold);
        self.override_with(env, "PRESENCE_OFFICE_LATITUDE", |c| &mut c.geofence.latitude);
        self.override_with(env, "PRESENCE_OFFICE_LONGITUDE", |c| &mut c.geofence.longitude);
        self.override_with(env, "PRESENCE_MAX_DISTANCE_METERS", |c| &mut c.geofence.max_distance_m);
        self.override_with(env, "PRESENCE_BUS", |c| &mut c.bus);

        if let Some(dir) = env("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
    }

    /// Apply one variable to a copy and keep it only if the copy validates.
    fn override_with<T: std::str::FromStr>(
        &mut self,
        env: &dyn Fn(&str) -> Option<String>,
        key: &str,
        field: fn(&mut Config) -> &mut T,
    ) {
        let Some(raw) = env(key) else {
            return;
        };
        let Ok(value) = raw.trim().parse::<T>() else {
            tracing::warn!(key, value = %raw, "ignoring unparseable config override");
            return;
        };
        let mut candidate = self.clone();
        *field(&mut candidate) = value;
        match candidate.validate() {
            Ok(()) => *self = candidate,
            Err(reason) => tracing::warn!(key, value = %raw, %reason, "ignoring out-of-range config override"),
        }
    }

    /// Check every tunable against its allowed range.
    pub fn validate(&self) -> Result<(), String> {
        let q = &self.quality;
        for (name, value) in [
            ("quality.brightness_min", q.brightness_min),
            ("quality.brightness_max", q.brightness_max),
        ] {
            if !(0.0..=255.0).contains(&value) {
                return Err(format!("{name} must be within [0, 255], got {value}"));
            }
        }
        if q.brightness_min > q.brightness_max {
            return Err(format!(
                "quality.brightness_min ({}) exceeds quality.brightness_max ({})",
                q.brightness_min, q.brightness_max
            ));
        }
        for (name, value) in [
            ("quality.blur_threshold", q.blur_threshold),
            ("quality.contrast_min", q.contrast_min),
            ("geofence.max_distance_m", self.geofence.max_distance_m),
            ("detection.crop_margin", f64::from(self.detection.crop_margin)),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("detection.confidence_threshold", self.detection.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if !(-90.0..=90.0).contains(&self.geofence.latitude) {
            return Err(format!("geofence.latitude out of range: {}", self.geofence.latitude));
        }
        if !(-180.0..=180.0).contains(&self.geofence.longitude) {
            return Err(format!("geofence.longitude out of range: {}", self.geofence.longitude));
        }
        Ok(())
    }

    /// Path to the SeetaFace frontal cascade model.
    pub fn cascade_model_path(&self) -> String {
        self.model_path("seeta_fd_frontal_v1.0.bin")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path("det_500m.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("w600k_mbf.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn data_dir(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}
