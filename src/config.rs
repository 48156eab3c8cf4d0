use std::{
    fs::File,
    path::{Path, PathBuf},
};

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::CoachError;

const APP_DIR_NAME: &str = "lapcoach";
const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 50;
pub const DEFAULT_MOVEMENT_SPEED_KMH: f32 = 5.0;

/// Thresholds used to split a lap into straights and corners.
///
/// The defaults are empirically tuned; they are kept overridable rather than
/// derived.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Lateral acceleration (g) above which a sample is cornering
    pub corner_g_lat: f32,
    /// Steering angle (degrees) above which a sample is cornering
    pub corner_steering_deg: f32,
    /// Runs shorter than this are noise and fold into a neighbour
    pub min_section_samples: usize,
    /// Longest straight that can sit between two same-direction corners and
    /// still be swallowed by them
    pub max_corner_gap_samples: usize,
    /// Longest corner that can sit between two straights and still be
    /// treated as wheel wobble
    pub max_straight_wobble_samples: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            corner_g_lat: 0.15,
            corner_steering_deg: 5.0,
            min_section_samples: 5,
            max_corner_gap_samples: 15,
            max_straight_wobble_samples: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Resolved once at startup. When false every analysis entry point
    /// returns an unavailable result.
    pub enabled: bool,
    pub min_laps_for_analysis: usize,
    /// Most wheels allowed outside the track limits before a section is invalid
    pub offtrack_tires_out: i32,
    /// Margin applied over the slowest corner speed when recommending an entry speed
    pub apex_margin: f32,
    /// Share of the entry speed recommended when the apex speed is not usable
    pub fallback_entry_factor: f32,
    /// Optimal tire operating window in °C
    pub optimal_tire_temp: (f32, f32),
    /// Left/right temperature difference in °C considered an imbalance
    pub tire_imbalance_c: f32,
    /// Corner minimum speed difference (km/h) worth reporting
    pub apex_speed_delta_kmh: f32,
    /// Sector deficit (s) reported as time lost
    pub sector_loss_s: f64,
    /// Sector improvement (s) reported as time gained
    pub sector_gain_s: f64,
    /// Throttle fraction counted as full throttle
    pub full_throttle: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_laps_for_analysis: 1,
            offtrack_tires_out: 2,
            apex_margin: 1.15,
            fallback_entry_factor: 0.85,
            optimal_tire_temp: (75., 95.),
            tire_imbalance_c: 10.,
            apex_speed_delta_kmh: 3.,
            sector_loss_s: 0.1,
            sector_gain_s: 0.05,
            full_throttle: 0.95,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CoachConfig {
    pub sample_interval_ms: u64,
    /// Samples buffered before a write to the store
    pub flush_batch_size: usize,
    /// Speed (km/h) the car must exceed before samples are recorded
    pub movement_speed_kmh: f32,
    pub segmenter: SegmenterConfig,
    pub analysis: AnalysisConfig,
    /// Where the file store keeps its data. Defaults to the user data dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            movement_speed_kmh: DEFAULT_MOVEMENT_SPEED_KMH,
            segmenter: SegmenterConfig::default(),
            analysis: AnalysisConfig::default(),
            data_dir: None,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

pub fn default_data_dir() -> Option<PathBuf> {
    Some(dirs::data_dir()?.join(APP_DIR_NAME))
}

impl CoachConfig {
    /// Load the user's config file. No config directory or no file there is
    /// `Ok(None)`; a file that cannot be loaded is an error, never a silent
    /// fallback to the defaults.
    pub fn from_local_file() -> Result<Option<Self>, CoachError> {
        match default_config_path() {
            Some(config_path) => Self::from_existing_path(&config_path),
            None => Ok(None),
        }
    }

    /// Like [`CoachConfig::from_path`], but a missing file is `Ok(None)`.
    pub fn from_existing_path(path: &Path) -> Result<Option<Self>, CoachError> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(None);
        }
        Self::from_path(path).map(Some).inspect_err(|e| {
            error!(
                "Config file {} could not be loaded, fix or remove it: {}",
                path.display(),
                e
            )
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, CoachError> {
        let file = File::open(path).map_err(|e| CoachError::ConfigIOError { source: e })?;
        let config: Self = serde_json::from_reader(file)
            .map_err(|e| CoachError::ConfigSerializeError { source: e })?;
        debug!("Loaded config from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), CoachError> {
        let config_path = default_config_path().ok_or(CoachError::NoConfigDir)?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), CoachError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoachError::ConfigIOError { source: e })?;
        }
        let file = File::create(path).map_err(|e| CoachError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| CoachError::ConfigSerializeError { source: e })
    }

    /// The directory the file store uses: the configured one, else the user data dir.
    pub fn resolved_data_dir(&self) -> Result<PathBuf, CoachError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir().ok_or(CoachError::NoConfigDir),
        }
    }

    pub fn validate(&self) -> Result<(), CoachError> {
        if self.sample_interval_ms == 0 {
            return Err(CoachError::InvalidUserInput {
                field: "sample_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.flush_batch_size == 0 {
            return Err(CoachError::InvalidUserInput {
                field: "flush_batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let (low, high) = self.analysis.optimal_tire_temp;
        if low >= high {
            return Err(CoachError::InvalidUserInput {
                field: "analysis.optimal_tire_temp".to_string(),
                reason: format!("lower bound {} must be below upper bound {}", low, high),
            });
        }
        Ok(())
    }
}
