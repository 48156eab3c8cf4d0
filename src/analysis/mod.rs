//! Post-session coaching: lap segmentation, section metrics, record keeping
//! and the recommendations built from them.

pub mod history;
pub(crate) mod recommendations;
pub mod sections;
pub mod segmenter;

use std::thread;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use history::{LapSummary, RecentLaps, SessionSummary, TrackHistory, recent_laps, track_history};
pub use sections::{AnalyzedSection, SectionMetrics, analyze_sections, recommended_entry_speed};
pub use segmenter::{Direction, Section, SectionType, segment_lap};

use crate::{
    CoachError,
    config::{AnalysisConfig, CoachConfig, SegmenterConfig},
    store::{
        Lap, LapId, LapRecord, RecordsBroken, SectionRecord, SessionId, TelemetryStore,
        records::{LapCandidate, update_records},
    },
    telemetry::{Sample, Wheels},
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Complete,
    /// Not enough laps or samples to say anything useful
    InsufficientData,
    /// Analysis is switched off
    Unavailable,
    /// Analysis ran into an error; the tracker carried on regardless
    Failed,
}

/// Post-race report for one session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionAnalysis {
    pub session_id: SessionId,
    pub outcome: AnalysisOutcome,
    pub analysis_complete: bool,
    pub recommendations: Vec<String>,
    /// Sections of the last complete lap
    pub sections: Vec<AnalyzedSection>,
    pub best_lap_id: Option<LapId>,
    pub best_lap_time: Option<f64>,
    pub last_lap_id: Option<LapId>,
    pub personal_record: Option<LapRecord>,
    pub section_records: Vec<SectionRecord>,
    pub records_broken: RecordsBroken,
}

impl SessionAnalysis {
    fn degraded(session_id: SessionId, outcome: AnalysisOutcome, message: String) -> Self {
        Self {
            session_id,
            outcome,
            analysis_complete: false,
            recommendations: vec![message],
            sections: Vec::new(),
            best_lap_id: None,
            best_lap_time: None,
            last_lap_id: None,
            personal_record: None,
            section_records: Vec::new(),
            records_broken: RecordsBroken::default(),
        }
    }

    pub fn unavailable(session_id: SessionId) -> Self {
        Self::degraded(
            session_id,
            AnalysisOutcome::Unavailable,
            recommendations::unavailable("analysis is disabled"),
        )
    }

    pub fn insufficient(session_id: SessionId, message: String) -> Self {
        Self::degraded(session_id, AnalysisOutcome::InsufficientData, message)
    }

    /// The report handed out when analysis itself failed.
    pub fn failed(session_id: SessionId, cause: &CoachError) -> Self {
        Self::degraded(
            session_id,
            AnalysisOutcome::Failed,
            recommendations::unavailable(&cause.to_string()),
        )
    }
}

/// Sections and metrics of a single lap.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapAnalysis {
    pub lap_id: LapId,
    pub lap_number: u32,
    pub lap_time: f64,
    pub is_valid: bool,
    pub outcome: AnalysisOutcome,
    pub sections: Vec<AnalyzedSection>,
}

fn lap_sections(
    samples: &[Sample],
    segmenter: &SegmenterConfig,
    analysis: &AnalysisConfig,
) -> Vec<AnalyzedSection> {
    analyze_sections(&segment_lap(samples, segmenter), analysis)
}

fn lap_analysis(lap: &Lap, samples: &[Sample], config: &CoachConfig) -> LapAnalysis {
    let sections = lap_sections(samples, &config.segmenter, &config.analysis);
    LapAnalysis {
        lap_id: lap.id,
        lap_number: lap.lap_number,
        lap_time: lap.lap_time,
        is_valid: lap.is_valid,
        outcome: if sections.is_empty() {
            AnalysisOutcome::InsufficientData
        } else {
            AnalysisOutcome::Complete
        },
        sections,
    }
}

/// Segment one stored lap and compute its section metrics.
pub fn analyze_lap(
    store: &dyn TelemetryStore,
    lap_id: LapId,
    config: &CoachConfig,
) -> Result<LapAnalysis, CoachError> {
    let lap = store.lap(lap_id)?;
    if !config.analysis.enabled {
        return Ok(LapAnalysis {
            lap_id,
            lap_number: lap.lap_number,
            lap_time: lap.lap_time,
            is_valid: lap.is_valid,
            outcome: AnalysisOutcome::Unavailable,
            sections: Vec::new(),
        });
    }
    let samples = store.read_samples(lap_id)?;
    Ok(lap_analysis(&lap, &samples, config))
}

/// Analyse several stored laps, segmenting them in parallel.
///
/// Samples are read up front; segmentation shares no state between laps.
pub fn analyze_laps(
    store: &dyn TelemetryStore,
    lap_ids: &[LapId],
    config: &CoachConfig,
) -> Result<Vec<LapAnalysis>, CoachError> {
    if !config.analysis.enabled {
        return lap_ids
            .iter()
            .map(|id| analyze_lap(store, *id, config))
            .collect();
    }

    let inputs = lap_ids
        .iter()
        .map(|id| Ok((store.lap(*id)?, store.read_samples(*id)?)))
        .collect::<Result<Vec<_>, CoachError>>()?;

    thread::scope(|scope| {
        let workers: Vec<_> = inputs
            .iter()
            .map(|(lap, samples)| scope.spawn(move || lap_analysis(lap, samples, config)))
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().map_err(|_| CoachError::AnalysisFailure {
                    reason: "lap analysis worker panicked".to_string(),
                })
            })
            .collect()
    })
}

/// Fastest valid lap, else the fastest complete one.
fn pick_best_lap(complete: &[&Lap]) -> Option<Lap> {
    let fastest = |laps: Vec<&&Lap>| {
        laps.into_iter()
            .min_by(|a, b| a.lap_time.total_cmp(&b.lap_time))
            .map(|lap| (*lap).clone())
    };
    fastest(complete.iter().filter(|l| l.is_valid).collect())
        .or_else(|| fastest(complete.iter().collect()))
}

fn apex_recommendations(
    best: &[AnalyzedSection],
    last: &[AnalyzedSection],
    config: &AnalysisConfig,
) -> Vec<String> {
    best.iter()
        .filter(|s| s.is_corner())
        .zip(last.iter().filter(|s| s.is_corner()))
        .enumerate()
        .filter(|(_, (_, last))| last.metrics.is_valid)
        .filter_map(|(i, (best, last))| {
            let delta = best.metrics.min_speed - last.metrics.min_speed;
            (delta > config.apex_speed_delta_kmh).then(|| recommendations::slower_apex(i + 1, delta))
        })
        .collect()
}

fn tire_recommendations(last: &[Sample], config: &AnalysisConfig) -> Vec<String> {
    let wheel_mean = |pick: fn(&Wheels<f32>) -> f32| sections::mean(last.iter().map(|s| pick(&s.tire_temp)));
    let (Some(fl), Some(fr), Some(rl), Some(rr)) = (
        wheel_mean(|w| w.fl),
        wheel_mean(|w| w.fr),
        wheel_mean(|w| w.rl),
        wheel_mean(|w| w.rr),
    ) else {
        return Vec::new();
    };

    let (low, high) = config.optimal_tire_temp;
    let mut recs = Vec::new();
    for (name, temp) in [
        ("Front-left", fl),
        ("Front-right", fr),
        ("Rear-left", rl),
        ("Rear-right", rr),
    ] {
        if temp < low {
            recs.push(recommendations::tire_cold(name, temp, config.optimal_tire_temp));
        } else if temp > high {
            recs.push(recommendations::tire_hot(name, temp, config.optimal_tire_temp));
        }
    }

    let front_diff = (fl - fr).abs();
    if front_diff > config.tire_imbalance_c {
        recs.push(recommendations::front_imbalance(front_diff));
    }
    let rear_diff = (rl - rr).abs();
    if rear_diff > config.tire_imbalance_c {
        recs.push(recommendations::rear_imbalance(rear_diff));
    }
    recs
}

/// Coefficient of variation of the lap times, in percent.
pub(crate) fn variation_pct(times: &[f64]) -> Option<f64> {
    if times.is_empty() {
        return None;
    }
    let n = times.len() as f64;
    let mean = times.iter().sum::<f64>() / n;
    if mean <= 0. {
        return None;
    }
    let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean * 100.)
}

fn consistency_recommendations(valid: &[&Lap]) -> Vec<String> {
    if valid.len() < 3 {
        return Vec::new();
    }
    let times: Vec<f64> = valid.iter().map(|l| l.lap_time).collect();
    variation_pct(&times)
        .map(recommendations::consistency)
        .into_iter()
        .collect()
}

fn sector_recommendations(valid: &[&Lap], best: &Lap, config: &AnalysisConfig) -> Vec<String> {
    let [.., _, last] = valid else {
        return Vec::new();
    };
    best.sector_times
        .iter()
        .zip(last.sector_times.iter())
        .enumerate()
        .filter_map(|(i, (best, last))| {
            let diff = (*last)? - (*best)?;
            if diff > config.sector_loss_s {
                Some(recommendations::sector_lost(i + 1, diff))
            } else if diff < -config.sector_gain_s {
                Some(recommendations::sector_gained(i + 1, diff.abs()))
            } else {
                None
            }
        })
        .collect()
}

fn off_track_recommendations(sections: &[AnalyzedSection]) -> Vec<String> {
    sections
        .iter()
        .filter(|s| s.is_corner())
        .enumerate()
        .filter(|(_, s)| !s.metrics.is_valid)
        .filter_map(|(i, s)| {
            let recommended = s.metrics.recommended_speed?;
            Some(recommendations::off_track_corner(
                i + 1,
                s.metrics.entry_speed,
                recommended,
            ))
        })
        .collect()
}

/// Build the post-race report for a session, update the personal records it
/// broke and save the report to the store.
pub fn analyze_session(
    store: &mut dyn TelemetryStore,
    session_id: SessionId,
    config: &CoachConfig,
) -> Result<SessionAnalysis, CoachError> {
    if !config.analysis.enabled {
        return Ok(SessionAnalysis::unavailable(session_id));
    }
    info!("Analyzing session {}", session_id);

    let session = store.session(session_id)?;
    let laps = store.session_laps(session_id)?;
    let complete: Vec<&Lap> = laps.iter().filter(|l| l.is_complete()).collect();
    debug!(
        "Session {} has {} laps, {} complete",
        session_id,
        laps.len(),
        complete.len()
    );

    let min_laps = config.analysis.min_laps_for_analysis.max(1);
    if complete.is_empty() {
        return Ok(SessionAnalysis::insufficient(
            session_id,
            recommendations::no_complete_laps(),
        ));
    }
    if complete.len() < min_laps {
        return Ok(SessionAnalysis::insufficient(
            session_id,
            recommendations::not_enough_laps(min_laps),
        ));
    }

    let Some(best_lap) = pick_best_lap(&complete) else {
        return Ok(SessionAnalysis::insufficient(
            session_id,
            recommendations::no_complete_laps(),
        ));
    };
    let last_lap = complete[complete.len() - 1].clone();

    let best_samples = store.read_samples(best_lap.id)?;
    let last_samples = if last_lap.id == best_lap.id {
        best_samples.clone()
    } else {
        store.read_samples(last_lap.id)?
    };

    let best_sections = lap_sections(&best_samples, &config.segmenter, &config.analysis);
    let last_sections = lap_sections(&last_samples, &config.segmenter, &config.analysis);
    let valid: Vec<&Lap> = complete.iter().copied().filter(|l| l.is_valid).collect();

    let mut recs = Vec::new();
    recs.extend(apex_recommendations(&best_sections, &last_sections, &config.analysis));
    recs.extend(tire_recommendations(&last_samples, &config.analysis));
    recs.extend(consistency_recommendations(&valid));
    recs.extend(sector_recommendations(&valid, &best_lap, &config.analysis));
    recs.extend(off_track_recommendations(&last_sections));

    let records_broken = update_records(
        store,
        &session.track_id,
        &session.vehicle_id,
        session_id,
        Some(&LapCandidate {
            lap_time: best_lap.lap_time,
            sector_times: best_lap.sector_times,
        }),
        &last_sections,
    )?;
    if records_broken.any() {
        recs.insert(
            0,
            recommendations::records_broken(best_lap.lap_time, &records_broken),
        );
    }

    let analysis = SessionAnalysis {
        session_id,
        outcome: AnalysisOutcome::Complete,
        analysis_complete: true,
        recommendations: recs,
        sections: last_sections,
        best_lap_id: Some(best_lap.id),
        best_lap_time: Some(best_lap.lap_time),
        last_lap_id: Some(last_lap.id),
        personal_record: store.lap_record(&session.track_id, &session.vehicle_id)?,
        section_records: store.section_records(&session.track_id, &session.vehicle_id)?,
        records_broken,
    };

    if let Err(e) = store.save_analysis(session_id, &analysis) {
        warn!("Could not save analysis for session {}: {}", session_id, e);
    }
    info!(
        "Analysis of session {} complete: {} recommendations",
        session_id,
        analysis.recommendations.len()
    );
    Ok(analysis)
}
