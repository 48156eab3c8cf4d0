use std::time::SystemTime;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    CoachError,
    analysis::{AnalyzedSection, SectionType},
};

use super::{SessionId, TelemetryStore};

/// Best lap and sector times for a track/vehicle combination.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapRecord {
    pub track_id: String,
    pub vehicle_id: String,
    pub best_lap_time: f64,
    pub best_sector_times: [Option<f64>; 3],
    /// Session that set the current best lap time
    pub session_id: SessionId,
    pub achieved_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Best time through one section of a track for a track/vehicle combination.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SectionRecord {
    pub track_id: String,
    pub vehicle_id: String,
    pub section_id: u32,
    pub section_type: SectionType,
    pub best_time: f64,
    pub best_avg_speed: f32,
    pub best_max_speed: f32,
    pub session_id: SessionId,
    pub achieved_at: SystemTime,
}

/// Which records a session improved.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordsBroken {
    pub lap: bool,
    /// 1-based sector numbers
    pub sectors: Vec<u8>,
    pub sections: Vec<u32>,
}

impl RecordsBroken {
    pub fn any(&self) -> bool {
        self.lap || !self.sectors.is_empty() || !self.sections.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LapCandidate {
    pub lap_time: f64,
    pub sector_times: [Option<f64>; 3],
}

fn improves(candidate: Option<f64>, stored: Option<f64>) -> bool {
    match (candidate, stored) {
        (Some(new), _) if new <= 0. => false,
        (Some(_), None) => true,
        (Some(new), Some(old)) => new < old,
        (None, _) => false,
    }
}

impl LapRecord {
    /// Fold a candidate lap into the current record.
    ///
    /// Returns the record to store (if anything changed) and what was broken.
    /// Ties never replace a stored best.
    pub fn merge(
        existing: Option<&LapRecord>,
        track_id: &str,
        vehicle_id: &str,
        session_id: SessionId,
        candidate: &LapCandidate,
        now: SystemTime,
    ) -> (Option<LapRecord>, Vec<u8>, bool) {
        let Some(current) = existing else {
            let sectors = candidate
                .sector_times
                .iter()
                .enumerate()
                .filter(|(_, t)| t.is_some_and(|t| t > 0.))
                .map(|(i, _)| i as u8 + 1)
                .collect();
            let record = LapRecord {
                track_id: track_id.to_string(),
                vehicle_id: vehicle_id.to_string(),
                best_lap_time: candidate.lap_time,
                best_sector_times: candidate.sector_times,
                session_id,
                achieved_at: now,
                updated_at: now,
            };
            return (Some(record), sectors, true);
        };

        let mut updated = current.clone();
        let lap_broken = candidate.lap_time > 0. && candidate.lap_time < current.best_lap_time;
        if lap_broken {
            updated.best_lap_time = candidate.lap_time;
            updated.session_id = session_id;
            updated.achieved_at = now;
        }

        let mut sectors = Vec::new();
        for (i, (new, old)) in candidate
            .sector_times
            .iter()
            .zip(current.best_sector_times.iter())
            .enumerate()
        {
            if improves(*new, *old) {
                updated.best_sector_times[i] = *new;
                sectors.push(i as u8 + 1);
            }
        }

        if !lap_broken && sectors.is_empty() {
            return (None, sectors, false);
        }
        updated.updated_at = now;
        (Some(updated), sectors, lap_broken)
    }
}

/// Compare a lap against the stored record for its track/vehicle. Returns
/// the record to write, if the lap improved anything.
fn plan_lap_record(
    store: &dyn TelemetryStore,
    track_id: &str,
    vehicle_id: &str,
    session_id: SessionId,
    candidate: &LapCandidate,
    now: SystemTime,
) -> Result<(Option<LapRecord>, RecordsBroken), CoachError> {
    let existing = store.lap_record(track_id, vehicle_id)?;
    let (record, sectors, lap) = LapRecord::merge(
        existing.as_ref(),
        track_id,
        vehicle_id,
        session_id,
        candidate,
        now,
    );
    Ok((
        record,
        RecordsBroken {
            lap,
            sectors,
            sections: Vec::new(),
        },
    ))
}

/// Section bests improved by `sections`. Off-track sections never set a
/// record.
fn plan_section_records(
    store: &dyn TelemetryStore,
    track_id: &str,
    vehicle_id: &str,
    session_id: SessionId,
    sections: &[AnalyzedSection],
    now: SystemTime,
) -> Result<Vec<SectionRecord>, CoachError> {
    let current = store.section_records(track_id, vehicle_id)?;
    Ok(sections
        .iter()
        .filter(|s| s.metrics.is_valid && s.metrics.time > 0.)
        .filter(|s| {
            current
                .iter()
                .find(|r| r.section_id == s.section_id)
                .is_none_or(|r| s.metrics.time < r.best_time)
        })
        .map(|s| SectionRecord {
            track_id: track_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            section_id: s.section_id,
            section_type: s.section_type,
            best_time: s.metrics.time,
            best_avg_speed: s.metrics.avg_speed,
            best_max_speed: s.metrics.max_speed,
            session_id,
            achieved_at: now,
        })
        .collect())
}

/// Fold a session's best lap and its analysed sections into the stored
/// records for the track/vehicle.
///
/// Lap, sector and section records change together in one store write, or
/// not at all.
pub fn update_records(
    store: &mut dyn TelemetryStore,
    track_id: &str,
    vehicle_id: &str,
    session_id: SessionId,
    candidate: Option<&LapCandidate>,
    sections: &[AnalyzedSection],
) -> Result<RecordsBroken, CoachError> {
    let now = SystemTime::now();
    let (lap_record, mut broken) = match candidate {
        Some(candidate) => {
            plan_lap_record(&*store, track_id, vehicle_id, session_id, candidate, now)?
        }
        None => (None, RecordsBroken::default()),
    };
    let section_records =
        plan_section_records(&*store, track_id, vehicle_id, session_id, sections, now)?;

    if lap_record.is_some() || !section_records.is_empty() {
        store.upsert_records(lap_record.as_ref(), &section_records)?;
    }
    if let Some(record) = lap_record.as_ref().filter(|_| broken.lap) {
        info!(
            "New lap record for {} at {}: {:.3}s",
            vehicle_id, track_id, record.best_lap_time
        );
    }
    broken.sections = section_records.iter().map(|r| r.section_id).collect();
    Ok(broken)
}
