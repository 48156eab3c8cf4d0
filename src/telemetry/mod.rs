pub mod collector;
pub mod producer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uom::si::f64::Time;
use uom::si::time::{millisecond, second};

pub use collector::collect_telemetry;
pub use producer::{MockSampleSource, SampleSource};

use crate::{
    CoachError,
    analysis::SessionAnalysis,
    store::{LapId, SessionId},
};

/// Per-wheel values, front-left to rear-right.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Wheels<T> {
    pub fl: T,
    pub fr: T,
    pub rl: T,
    pub rr: T,
}

impl<T: Copy> Wheels<T> {
    pub fn splat(value: T) -> Self {
        Self {
            fl: value,
            fr: value,
            rl: value,
            rr: value,
        }
    }

    pub fn to_array(&self) -> [T; 4] {
        [self.fl, self.fr, self.rl, self.rr]
    }
}

/// World position of the car in simulator coordinates.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// One recorded telemetry sample, owned by a lap once written.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub lap_id: LapId,
    /// Lap clock in seconds
    pub timestamp: f64,
    /// Speed in km/h
    pub speed: f32,
    pub rpm: i32,
    pub gear: i32,
    pub position: Position,
    /// Fraction of the lap completed, 0.0 to 1.0
    pub normalized_position: f32,
    /// Throttle use. 0=off throttle to 1=full throttle
    pub throttle: f32,
    /// Brake use. 0=brake released to 1=max pedal force
    pub brake: f32,
    /// Steering angle in radians, positive to the right
    pub steering: f32,
    /// Lateral acceleration in g, positive to the right
    pub g_lat: f32,
    /// Longitudinal acceleration in g
    pub g_long: f32,
    pub tire_temp: Wheels<f32>,
    pub tire_pressure: Wheels<f32>,
    pub brake_temp: Wheels<f32>,
    pub fuel: f32,
    /// Number of wheels outside the track limits
    pub tires_out: i32,
}

/// Simulator run state as reported by the source.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SimStatus {
    #[default]
    Off,
    Replay,
    Live,
    Pause,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Practice,
    Qualify,
    Race,
    Hotlap,
    TimeAttack,
    Drift,
    Drag,
    #[default]
    Unknown,
}

impl SessionKind {
    /// Practice sessions spawn the car mid-track, so the first line crossing
    /// closes a partial lap.
    pub fn starts_mid_track(&self) -> bool {
        matches!(self, SessionKind::Practice)
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Practice => write!(f, "Practice"),
            SessionKind::Qualify => write!(f, "Qualify"),
            SessionKind::Race => write!(f, "Race"),
            SessionKind::Hotlap => write!(f, "Hotlap"),
            SessionKind::TimeAttack => write!(f, "Time Attack"),
            SessionKind::Drift => write!(f, "Drift"),
            SessionKind::Drag => write!(f, "Drag"),
            SessionKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Raw per-tick state published by the simulator.
///
/// Lap and sector times are in milliseconds, exactly as the simulator reports
/// them; the tracker converts them to seconds when it writes laps.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceSnapshot {
    pub status: SimStatus,
    pub session_kind: SessionKind,
    pub session_index: i32,
    pub track_name: String,
    pub track_config: Option<String>,
    pub car_name: String,
    pub completed_laps: i32,
    pub current_lap_time_ms: i32,
    pub last_lap_time_ms: i32,
    pub best_lap_time_ms: i32,
    /// Raw valid flag for the running lap. Simulators reset it every lap.
    pub is_valid_lap: bool,
    /// 0-based index of the sector the car is in
    pub current_sector_index: i32,
    pub last_sector_time_ms: i32,
    pub tires_out: i32,
    pub speed_kmh: f32,
    pub rpm: i32,
    pub gear: i32,
    pub throttle: f32,
    pub brake: f32,
    pub steering_rad: f32,
    pub position: Position,
    pub normalized_position: f32,
    pub g_lat: f32,
    pub g_long: f32,
    pub tire_temp: Wheels<f32>,
    pub tire_pressure: Wheels<f32>,
    pub brake_temp: Wheels<f32>,
    pub fuel: f32,
    /// Lap clock in seconds
    pub timestamp_s: f64,
    /// Simulator specific channels that are not part of the recorded sample
    pub extras: HashMap<String, serde_json::Value>,
}

pub(crate) fn ms_to_seconds(ms: i32) -> f64 {
    Time::new::<millisecond>(ms as f64).get::<second>()
}

impl SourceSnapshot {
    /// Whether the simulator is running (or paused in) a session we record.
    pub fn is_in_session(&self) -> bool {
        matches!(self.status, SimStatus::Live | SimStatus::Pause)
            && self.session_kind != SessionKind::Unknown
    }

    /// Track identifier, including the layout when the simulator reports one.
    pub fn track_id(&self) -> String {
        match self.track_config.as_deref().map(str::trim) {
            Some(config) if !config.is_empty() => format!("{}@{}", self.track_name, config),
            _ => self.track_name.clone(),
        }
    }

    pub fn last_lap_time_s(&self) -> Option<f64> {
        (self.last_lap_time_ms > 0).then(|| ms_to_seconds(self.last_lap_time_ms))
    }

    pub fn best_lap_time_s(&self) -> Option<f64> {
        (self.best_lap_time_ms > 0).then(|| ms_to_seconds(self.best_lap_time_ms))
    }

    /// Reject snapshots the simulator published half-written or garbled.
    pub fn validate(&self) -> Result<(), CoachError> {
        let channels = [
            ("speed_kmh", self.speed_kmh),
            ("throttle", self.throttle),
            ("brake", self.brake),
            ("steering_rad", self.steering_rad),
            ("normalized_position", self.normalized_position),
            ("g_lat", self.g_lat),
            ("g_long", self.g_long),
            ("fuel", self.fuel),
            ("position.x", self.position.x),
            ("position.y", self.position.y),
            ("position.z", self.position.z),
        ];
        if let Some((name, value)) = channels.iter().find(|(_, v)| !v.is_finite()) {
            return Err(CoachError::MalformedSample {
                reason: format!("{} is not a finite number ({})", name, value),
            });
        }
        let wheels = self
            .tire_temp
            .to_array()
            .into_iter()
            .chain(self.tire_pressure.to_array())
            .chain(self.brake_temp.to_array());
        if wheels.into_iter().any(|v| !v.is_finite()) {
            return Err(CoachError::MalformedSample {
                reason: "wheel channel is not a finite number".to_string(),
            });
        }
        if !self.timestamp_s.is_finite() {
            return Err(CoachError::MalformedSample {
                reason: format!("timestamp is not a finite number ({})", self.timestamp_s),
            });
        }
        if self.tires_out < 0 {
            return Err(CoachError::MalformedSample {
                reason: format!("negative tires out count ({})", self.tires_out),
            });
        }
        Ok(())
    }

    /// The recordable part of this snapshot, tagged with the lap it belongs to.
    pub fn to_sample(&self, lap_id: LapId) -> Sample {
        Sample {
            lap_id,
            timestamp: self.timestamp_s,
            speed: self.speed_kmh,
            rpm: self.rpm,
            gear: self.gear,
            position: self.position,
            normalized_position: self.normalized_position,
            throttle: self.throttle,
            brake: self.brake,
            steering: self.steering_rad,
            g_lat: self.g_lat,
            g_long: self.g_long,
            tire_temp: self.tire_temp,
            tire_pressure: self.tire_pressure,
            brake_temp: self.brake_temp,
            fuel: self.fuel,
            tires_out: self.tires_out,
        }
    }
}

/// A snapshot forwarded for live display, enriched with the active lap state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LiveSample {
    pub lap_id: Option<LapId>,
    /// Display lap number (1-based) of the lap being driven
    pub lap_number: u32,
    /// Whether the sample was queued for storage
    pub recorded: bool,
    /// Latched validity of the running lap
    pub lap_valid: bool,
    /// Smoothed sampling rate of the source
    pub sample_rate_hz: Option<f64>,
    pub snapshot: SourceSnapshot,
}

/// Lifecycle and live display events produced by the tracker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    SourceConnected,
    SourceDisconnected,
    SessionStarted {
        session_id: SessionId,
        track: String,
        vehicle: String,
        kind: SessionKind,
    },
    Sample(Box<LiveSample>),
    LapCompleted {
        lap_number: u32,
        lap_time: f64,
        is_valid: bool,
        best_lap_time: Option<f64>,
    },
    SessionEnded {
        session_id: SessionId,
        analysis: Box<SessionAnalysis>,
    },
    StorageError {
        lap_id: Option<LapId>,
        reason: String,
    },
}
