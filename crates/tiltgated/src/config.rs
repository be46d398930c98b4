use crate::pipeline::PipelineSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tiltgate_core::{GestureConfig, TiltMapping};
use tiltgate_hw::CaptureConstraints;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Optional settings read from `config.toml`. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub camera_device: Option<String>,
    pub capture_width: Option<u32>,
    pub capture_height: Option<u32>,
    pub model_dir: Option<PathBuf>,
    pub frame_rate: Option<u32>,
    pub tilt_threshold_deg: Option<f32>,
    pub cooldown_ms: Option<u64>,
    pub indicator_hold_ms: Option<u64>,
    pub smoothing_factor: Option<f32>,
    pub positive_tilt: Option<String>,
    pub enable_on_start: Option<bool>,
}

impl ConfigFile {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Daemon configuration: defaults, then `config.toml`, then `TILTGATE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing `det_10g.onnx`.
    pub model_dir: PathBuf,
    /// Frame loop ticks per second.
    pub frame_rate: u32,
    pub tilt_threshold_deg: f32,
    pub cooldown_ms: u64,
    pub indicator_hold_ms: u64,
    /// History weight of the angle EMA.
    pub smoothing_factor: f32,
    /// Direction a positive roll angle maps to.
    pub positive_tilt: TiltMapping,
    /// Start the pipeline as soon as the daemon is up.
    pub enable_on_start: bool,
}

impl Config {
    /// Load from `$TILTGATE_CONFIG` (or the XDG default path, if it exists) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("TILTGATE_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::info!(path = %path.display(), "loaded config file");
                ConfigFile::parse(&path, &text)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                ConfigFile::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Layer `env` over `file` over the built-in defaults, then validate.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = GestureConfig::default();

        let file_tilt: Option<TiltMapping> = file
            .positive_tilt
            .map(|raw| raw.parse().map_err(ConfigError::Invalid))
            .transpose()?;
        let positive_tilt = env_parse(&env, "TILTGATE_POSITIVE_TILT")
            .or(file_tilt)
            .unwrap_or_default();

        let config = Self {
            camera_device: env("TILTGATE_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            capture_width: env_parse(&env, "TILTGATE_CAPTURE_WIDTH").or(file.capture_width).unwrap_or(320),
            capture_height: env_parse(&env, "TILTGATE_CAPTURE_HEIGHT").or(file.capture_height).unwrap_or(240),
            model_dir: env("TILTGATE_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(tiltgate_core::default_model_dir),
            frame_rate: env_parse(&env, "TILTGATE_FRAME_RATE").or(file.frame_rate).unwrap_or(30),
            tilt_threshold_deg: env_parse(&env, "TILTGATE_TILT_THRESHOLD_DEG")
                .or(file.tilt_threshold_deg)
                .unwrap_or(defaults.threshold_deg),
            cooldown_ms: env_parse(&env, "TILTGATE_COOLDOWN_MS")
                .or(file.cooldown_ms)
                .unwrap_or(defaults.cooldown.as_millis() as u64),
            indicator_hold_ms: env_parse(&env, "TILTGATE_INDICATOR_HOLD_MS")
                .or(file.indicator_hold_ms)
                .unwrap_or(defaults.indicator_hold.as_millis() as u64),
            smoothing_factor: env_parse(&env, "TILTGATE_SMOOTHING_FACTOR")
                .or(file.smoothing_factor)
                .unwrap_or(tiltgate_core::AngleSmoother::DEFAULT_ALPHA),
            positive_tilt,
            enable_on_start: env("TILTGATE_ENABLE_ON_START")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.enable_on_start)
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(ConfigError::Invalid("capture size must be non-zero".into()));
        }
        if !(1..=MAX_FRAME_RATE).contains(&self.frame_rate) {
            return Err(ConfigError::Invalid(format!(
                "frame_rate must be between 1 and {MAX_FRAME_RATE}, got {}",
                self.frame_rate
            )));
        }
        if !(self.tilt_threshold_deg > 0.0 && self.tilt_threshold_deg < 90.0) {
            return Err(ConfigError::Invalid(format!(
                "tilt_threshold_deg must be in (0, 90), got {}",
                self.tilt_threshold_deg
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing_factor) {
            return Err(ConfigError::Invalid(format!(
                "smoothing_factor must be in [0, 1), got {}",
                self.smoothing_factor
            )));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            constraints: CaptureConstraints {
                width: self.capture_width,
                height: self.capture_height,
            },
            gesture: GestureConfig {
                threshold_deg: self.tilt_threshold_deg,
                cooldown: Duration::from_millis(self.cooldown_ms),
                indicator_hold: Duration::from_millis(self.indicator_hold_ms),
                mapping: self.positive_tilt,
            },
            smoothing_factor: self.smoothing_factor,
            frame_interval: Duration::from_secs(1) / self.frame_rate,
        }
    }
}

/// Upper bound for `frame_rate`; keeps the tick interval at 1 ms or more.
const MAX_FRAME_RATE: u32 = 1000;

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("tiltgate")
        .join("config.toml")
}

/// Parse an environment value, ignoring (with a warning) values that do not parse.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}
