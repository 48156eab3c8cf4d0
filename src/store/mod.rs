//! Durable records of sessions, laps and their samples.
//!
//! The tracker writes through the [`TelemetryStore`] trait and the analysis
//! pipeline reads back through it, so both work against the in-memory store in
//! tests and the file store in the binary.

pub mod file;
pub mod records;

use std::{collections::BTreeMap, collections::HashMap, fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

pub use file::FileBasedStore;
pub use records::{LapRecord, RecordsBroken, SectionRecord};

use crate::{
    CoachError,
    analysis::SessionAnalysis,
    telemetry::{Sample, SessionKind},
};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LapId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub track_id: String,
    pub vehicle_id: String,
    pub kind: SessionKind,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub total_laps: u32,
    pub best_lap_time: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum LapStatus {
    /// Row created at the start of the lap, not yet finalized
    #[default]
    Provisional,
    /// Closed by a finish line crossing
    Completed,
    /// Closed because the session ended before the lap did
    Incomplete,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Lap {
    pub id: LapId,
    pub session_id: SessionId,
    /// 1-based display number
    pub lap_number: u32,
    /// Lap time in seconds, 0.0 until the lap completes
    pub lap_time: f64,
    pub sector_times: [Option<f64>; 3],
    pub is_valid: bool,
    pub max_speed: f32,
    pub avg_speed: f32,
    pub status: LapStatus,
}

impl Lap {
    /// A lap closed by the simulator with a usable time.
    pub fn is_complete(&self) -> bool {
        self.status == LapStatus::Completed && self.lap_time > 0.
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LapUpdate {
    pub lap_time: f64,
    pub max_speed: f32,
    pub avg_speed: f32,
    pub is_valid: bool,
    pub sector_times: [Option<f64>; 3],
    pub status: LapStatus,
}

/// Partial session update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub total_laps: Option<u32>,
    pub best_lap_time: Option<f64>,
    pub end_time: Option<SystemTime>,
}

pub trait TelemetryStore: Send {
    fn create_session(
        &mut self,
        track_id: &str,
        vehicle_id: &str,
        kind: SessionKind,
        start_time: SystemTime,
    ) -> Result<SessionId, CoachError>;

    fn create_lap(
        &mut self,
        session_id: SessionId,
        lap_number: u32,
        lap_time: f64,
        is_valid: bool,
        max_speed: f32,
        avg_speed: f32,
    ) -> Result<LapId, CoachError>;

    fn update_lap(&mut self, lap_id: LapId, update: &LapUpdate) -> Result<(), CoachError>;

    /// Append a batch to the end of a lap. Callers keep batches of one lap in
    /// timestamp order.
    fn append_samples(&mut self, lap_id: LapId, samples: &[Sample]) -> Result<(), CoachError>;

    /// All samples of a lap, in the order they were appended.
    fn read_samples(&self, lap_id: LapId) -> Result<Vec<Sample>, CoachError>;

    fn update_session(
        &mut self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<(), CoachError>;

    fn session(&self, session_id: SessionId) -> Result<Session, CoachError>;

    fn lap(&self, lap_id: LapId) -> Result<Lap, CoachError>;

    /// Laps of a session ordered by lap number.
    fn session_laps(&self, session_id: SessionId) -> Result<Vec<Lap>, CoachError>;

    /// Sessions on a track, oldest first, optionally narrowed to one vehicle.
    fn sessions_for_track(
        &self,
        track_id: &str,
        vehicle_id: Option<&str>,
    ) -> Result<Vec<Session>, CoachError>;

    fn lap_record(&self, track_id: &str, vehicle_id: &str)
    -> Result<Option<LapRecord>, CoachError>;

    fn section_records(
        &self,
        track_id: &str,
        vehicle_id: &str,
    ) -> Result<Vec<SectionRecord>, CoachError>;

    /// Insert or replace a lap record and any number of section records as a
    /// single write. On error none of them is stored.
    fn upsert_records(
        &mut self,
        lap_record: Option<&LapRecord>,
        section_records: &[SectionRecord],
    ) -> Result<(), CoachError>;

    fn save_analysis(
        &mut self,
        session_id: SessionId,
        analysis: &SessionAnalysis,
    ) -> Result<(), CoachError>;

    fn analysis(&self, session_id: SessionId) -> Result<Option<SessionAnalysis>, CoachError>;
}

/// Everything a store keeps apart from the samples themselves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct StoreIndex {
    next_session_id: u64,
    next_lap_id: u64,
    sessions: BTreeMap<SessionId, Session>,
    laps: BTreeMap<LapId, Lap>,
    lap_records: Vec<LapRecord>,
    section_records: Vec<SectionRecord>,
    /// Kept out of the index document; the file store writes one file per
    /// analysis.
    #[serde(skip)]
    analyses: BTreeMap<SessionId, SessionAnalysis>,
}

impl StoreIndex {
    pub(crate) fn create_session(
        &mut self,
        track_id: &str,
        vehicle_id: &str,
        kind: SessionKind,
        start_time: SystemTime,
    ) -> SessionId {
        self.next_session_id += 1;
        let id = SessionId(self.next_session_id);
        self.sessions.insert(
            id,
            Session {
                id,
                track_id: track_id.to_string(),
                vehicle_id: vehicle_id.to_string(),
                kind,
                start_time,
                end_time: None,
                total_laps: 0,
                best_lap_time: None,
            },
        );
        id
    }

    pub(crate) fn create_lap(
        &mut self,
        session_id: SessionId,
        lap_number: u32,
        lap_time: f64,
        is_valid: bool,
        max_speed: f32,
        avg_speed: f32,
    ) -> Result<LapId, CoachError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(CoachError::not_found("session", session_id.0));
        }
        self.next_lap_id += 1;
        let id = LapId(self.next_lap_id);
        self.laps.insert(
            id,
            Lap {
                id,
                session_id,
                lap_number,
                lap_time,
                sector_times: [None; 3],
                is_valid,
                max_speed,
                avg_speed,
                status: LapStatus::Provisional,
            },
        );
        Ok(id)
    }

    pub(crate) fn update_lap(&mut self, lap_id: LapId, update: &LapUpdate) -> Result<(), CoachError> {
        let lap = self
            .laps
            .get_mut(&lap_id)
            .ok_or_else(|| CoachError::not_found("lap", lap_id.0))?;
        lap.lap_time = update.lap_time;
        lap.max_speed = update.max_speed;
        lap.avg_speed = update.avg_speed;
        lap.is_valid = update.is_valid;
        lap.sector_times = update.sector_times;
        lap.status = update.status;
        Ok(())
    }

    pub(crate) fn update_session(
        &mut self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<(), CoachError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoachError::not_found("session", session_id.0))?;
        if let Some(total_laps) = update.total_laps {
            session.total_laps = total_laps;
        }
        if let Some(best) = update.best_lap_time {
            session.best_lap_time = Some(best);
        }
        if let Some(end_time) = update.end_time {
            session.end_time = Some(end_time);
        }
        Ok(())
    }

    pub(crate) fn has_session(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub(crate) fn has_lap(&self, lap_id: LapId) -> bool {
        self.laps.contains_key(&lap_id)
    }

    pub(crate) fn session(&self, session_id: SessionId) -> Result<Session, CoachError> {
        self.sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| CoachError::not_found("session", session_id.0))
    }

    pub(crate) fn lap(&self, lap_id: LapId) -> Result<Lap, CoachError> {
        self.laps
            .get(&lap_id)
            .cloned()
            .ok_or_else(|| CoachError::not_found("lap", lap_id.0))
    }

    pub(crate) fn session_laps(&self, session_id: SessionId) -> Result<Vec<Lap>, CoachError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(CoachError::not_found("session", session_id.0));
        }
        let mut laps: Vec<Lap> = self
            .laps
            .values()
            .filter(|lap| lap.session_id == session_id)
            .cloned()
            .collect();
        laps.sort_by_key(|lap| (lap.lap_number, lap.id));
        Ok(laps)
    }

    pub(crate) fn sessions_for_track(&self, track_id: &str, vehicle_id: Option<&str>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| s.track_id == track_id)
            .filter(|s| vehicle_id.is_none_or(|v| s.vehicle_id == v))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.start_time, s.id));
        sessions
    }

    pub(crate) fn lap_record(&self, track_id: &str, vehicle_id: &str) -> Option<LapRecord> {
        self.lap_records
            .iter()
            .find(|r| r.track_id == track_id && r.vehicle_id == vehicle_id)
            .cloned()
    }

    pub(crate) fn upsert_records(
        &mut self,
        lap_record: Option<&LapRecord>,
        section_records: &[SectionRecord],
    ) {
        if let Some(record) = lap_record {
            self.upsert_lap_record(record);
        }
        self.upsert_section_records(section_records);
    }

    fn upsert_lap_record(&mut self, record: &LapRecord) {
        match self
            .lap_records
            .iter_mut()
            .find(|r| r.track_id == record.track_id && r.vehicle_id == record.vehicle_id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.lap_records.push(record.clone()),
        }
    }

    pub(crate) fn section_records(&self, track_id: &str, vehicle_id: &str) -> Vec<SectionRecord> {
        let mut records: Vec<SectionRecord> = self
            .section_records
            .iter()
            .filter(|r| r.track_id == track_id && r.vehicle_id == vehicle_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.section_id);
        records
    }

    fn upsert_section_records(&mut self, records: &[SectionRecord]) {
        for record in records {
            match self.section_records.iter_mut().find(|r| {
                r.track_id == record.track_id
                    && r.vehicle_id == record.vehicle_id
                    && r.section_id == record.section_id
            }) {
                Some(existing) => *existing = record.clone(),
                None => self.section_records.push(record.clone()),
            }
        }
    }

    pub(crate) fn save_analysis(
        &mut self,
        session_id: SessionId,
        analysis: &SessionAnalysis,
    ) -> Result<(), CoachError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(CoachError::not_found("session", session_id.0));
        }
        self.analyses.insert(session_id, analysis.clone());
        Ok(())
    }

    pub(crate) fn analysis(&self, session_id: SessionId) -> Option<SessionAnalysis> {
        self.analyses.get(&session_id).cloned()
    }
}

/// A store that lives and dies with the process.
///
/// Sample appends and index writes can be made to fail on demand, which is
/// how the tracker's handling of a broken store is exercised.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    index: StoreIndex,
    samples: HashMap<LapId, Vec<Sample>>,
    fail_appends: bool,
    fail_writes: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    /// Reject every change to sessions, laps, records and analyses.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self, what: &str) -> Result<(), CoachError> {
        if self.fail_writes {
            return Err(CoachError::StorageWriteFailure {
                reason: format!("{} rejected", what),
            });
        }
        Ok(())
    }
}

impl TelemetryStore for InMemoryStore {
    fn create_session(
        &mut self,
        track_id: &str,
        vehicle_id: &str,
        kind: SessionKind,
        start_time: SystemTime,
    ) -> Result<SessionId, CoachError> {
        self.check_writable("session creation")?;
        Ok(self
            .index
            .create_session(track_id, vehicle_id, kind, start_time))
    }

    fn create_lap(
        &mut self,
        session_id: SessionId,
        lap_number: u32,
        lap_time: f64,
        is_valid: bool,
        max_speed: f32,
        avg_speed: f32,
    ) -> Result<LapId, CoachError> {
        self.check_writable("lap creation")?;
        self.index
            .create_lap(session_id, lap_number, lap_time, is_valid, max_speed, avg_speed)
    }

    fn update_lap(&mut self, lap_id: LapId, update: &LapUpdate) -> Result<(), CoachError> {
        self.check_writable("lap update")?;
        self.index.update_lap(lap_id, update)
    }

    fn append_samples(&mut self, lap_id: LapId, samples: &[Sample]) -> Result<(), CoachError> {
        if self.fail_appends {
            return Err(CoachError::StorageWriteFailure {
                reason: format!("append to lap {} rejected", lap_id),
            });
        }
        if !self.index.has_lap(lap_id) {
            return Err(CoachError::not_found("lap", lap_id.0));
        }
        self.samples
            .entry(lap_id)
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    fn read_samples(&self, lap_id: LapId) -> Result<Vec<Sample>, CoachError> {
        if !self.index.has_lap(lap_id) {
            return Err(CoachError::not_found("lap", lap_id.0));
        }
        Ok(self.samples.get(&lap_id).cloned().unwrap_or_default())
    }

    fn update_session(
        &mut self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<(), CoachError> {
        self.check_writable("session update")?;
        self.index.update_session(session_id, update)
    }

    fn session(&self, session_id: SessionId) -> Result<Session, CoachError> {
        self.index.session(session_id)
    }

    fn lap(&self, lap_id: LapId) -> Result<Lap, CoachError> {
        self.index.lap(lap_id)
    }

    fn session_laps(&self, session_id: SessionId) -> Result<Vec<Lap>, CoachError> {
        self.index.session_laps(session_id)
    }

    fn sessions_for_track(
        &self,
        track_id: &str,
        vehicle_id: Option<&str>,
    ) -> Result<Vec<Session>, CoachError> {
        Ok(self.index.sessions_for_track(track_id, vehicle_id))
    }

    fn lap_record(
        &self,
        track_id: &str,
        vehicle_id: &str,
    ) -> Result<Option<LapRecord>, CoachError> {
        Ok(self.index.lap_record(track_id, vehicle_id))
    }

    fn section_records(
        &self,
        track_id: &str,
        vehicle_id: &str,
    ) -> Result<Vec<SectionRecord>, CoachError> {
        Ok(self.index.section_records(track_id, vehicle_id))
    }

    fn upsert_records(
        &mut self,
        lap_record: Option<&LapRecord>,
        section_records: &[SectionRecord],
    ) -> Result<(), CoachError> {
        self.check_writable("record update")?;
        self.index.upsert_records(lap_record, section_records);
        Ok(())
    }

    fn save_analysis(
        &mut self,
        session_id: SessionId,
        analysis: &SessionAnalysis,
    ) -> Result<(), CoachError> {
        self.check_writable("analysis")?;
        self.index.save_analysis(session_id, analysis)
    }

    fn analysis(&self, session_id: SessionId) -> Result<Option<SessionAnalysis>, CoachError> {
        Ok(self.index.analysis(session_id))
    }
}
