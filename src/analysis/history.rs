use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{
    CoachError,
    store::{Lap, LapId, LapStatus, Session, SessionId, TelemetryStore},
    telemetry::SessionKind,
};

use super::{sections, variation_pct};

/// Sessions with fewer laps than this are not counted as races.
const MIN_RACE_LAPS: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub start_time: SystemTime,
    pub total_laps: u32,
    pub best_lap_time: Option<f64>,
    /// Mean of the laps' average speeds
    pub avg_speed: Option<f32>,
    pub off_track_laps: usize,
    /// (lap number, lap time) of every complete lap
    pub pace: Vec<(u32, f64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackHistory {
    pub track_id: String,
    pub vehicle_id: Option<String>,
    pub available: bool,
    pub message: Option<String>,
    /// Oldest first
    pub sessions: Vec<SessionSummary>,
    /// Session with the fastest best lap
    pub best_session: Option<SessionId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapSummary {
    pub lap_id: LapId,
    pub lap_number: u32,
    pub lap_time: f64,
    pub sector_times: [Option<f64>; 3],
    pub avg_speed: f32,
    pub is_valid: bool,
    pub is_best: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecentLaps {
    pub session_id: SessionId,
    pub available: bool,
    pub message: Option<String>,
    pub laps: Vec<LapSummary>,
    /// 100 minus the lap time variation in percent
    pub consistency_score: f64,
    pub std_dev: f64,
    pub best_lap_id: Option<LapId>,
}

fn summarize(session: &Session, laps: &[Lap]) -> SessionSummary {
    let finished: Vec<&Lap> = laps
        .iter()
        .filter(|l| l.status != LapStatus::Provisional)
        .collect();
    SessionSummary {
        session_id: session.id,
        kind: session.kind,
        start_time: session.start_time,
        total_laps: session.total_laps,
        best_lap_time: session.best_lap_time,
        avg_speed: sections::mean(
            finished
                .iter()
                .map(|l| l.avg_speed)
                .filter(|speed| *speed > 0.),
        )
        .map(|speed| sections::round_to(speed, 1)),
        off_track_laps: finished.iter().filter(|l| !l.is_valid).count(),
        pace: laps
            .iter()
            .filter(|l| l.is_complete())
            .map(|l| (l.lap_number, l.lap_time))
            .collect(),
    }
}

/// The last `count` races (sessions with at least three laps) on a track.
pub fn track_history(
    store: &dyn TelemetryStore,
    track_id: &str,
    vehicle_id: Option<&str>,
    count: usize,
) -> Result<TrackHistory, CoachError> {
    let races: Vec<_> = store
        .sessions_for_track(track_id, vehicle_id)?
        .into_iter()
        .filter(|s| s.total_laps >= MIN_RACE_LAPS)
        .collect();
    let recent = &races[races.len().saturating_sub(count)..];

    let mut sessions = Vec::with_capacity(recent.len());
    for session in recent {
        let laps = store.session_laps(session.id)?;
        sessions.push(summarize(session, &laps));
    }

    let best_session = sessions
        .iter()
        .filter_map(|s| s.best_lap_time.map(|t| (s.session_id, t)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id);

    let available = !sessions.is_empty();
    Ok(TrackHistory {
        track_id: track_id.to_string(),
        vehicle_id: vehicle_id.map(str::to_string),
        available,
        message: (!available).then(|| {
            format!(
                "No races recorded at {} (at least {} laps)",
                track_id, MIN_RACE_LAPS
            )
        }),
        sessions,
        best_session,
    })
}

/// The last `count` complete laps of a session with a consistency score.
pub fn recent_laps(
    store: &dyn TelemetryStore,
    session_id: SessionId,
    count: usize,
) -> Result<RecentLaps, CoachError> {
    let complete: Vec<Lap> = store
        .session_laps(session_id)?
        .into_iter()
        .filter(Lap::is_complete)
        .collect();
    let recent = &complete[complete.len().saturating_sub(count)..];

    if recent.is_empty() {
        return Ok(RecentLaps {
            session_id,
            available: false,
            message: Some("No complete laps recorded.".to_string()),
            laps: Vec::new(),
            consistency_score: 0.,
            std_dev: 0.,
            best_lap_id: None,
        });
    }

    let best_lap_id = recent
        .iter()
        .filter(|l| l.is_valid)
        .min_by(|a, b| a.lap_time.total_cmp(&b.lap_time))
        .map(|l| l.id);

    let times: Vec<f64> = recent.iter().map(|l| l.lap_time).collect();
    let (consistency_score, std_dev) = if times.len() > 1 {
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        let pct = variation_pct(&times).unwrap_or(0.);
        (100. - pct, pct / 100. * mean)
    } else {
        (100., 0.)
    };

    Ok(RecentLaps {
        session_id,
        available: true,
        message: None,
        laps: recent
            .iter()
            .map(|l| LapSummary {
                lap_id: l.id,
                lap_number: l.lap_number,
                lap_time: l.lap_time,
                sector_times: l.sector_times,
                avg_speed: l.avg_speed,
                is_valid: l.is_valid,
                is_best: Some(l.id) == best_lap_id,
            })
            .collect(),
        consistency_score: (consistency_score * 10.).round() / 10.,
        std_dev: (std_dev * 1000.).round() / 1000.,
        best_lap_id,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{InMemoryStore, LapUpdate, SessionUpdate};

    fn session_with_laps(
        store: &mut InMemoryStore,
        start_offset_s: u64,
        laps: &[(f64, bool)],
    ) -> SessionId {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + start_offset_s);
        let session = store
            .create_session("ks_silverstone@gp", "ks_mclaren_650_gt3", SessionKind::Race, start)
            .unwrap();
        for (i, (time, valid)) in laps.iter().enumerate() {
            let lap = store
                .create_lap(session, i as u32 + 1, 0., true, 0., 0.)
                .unwrap();
            store
                .update_lap(
                    lap,
                    &LapUpdate {
                        lap_time: *time,
                        max_speed: 250.,
                        avg_speed: 160. + i as f32,
                        is_valid: *valid,
                        sector_times: [None; 3],
                        status: LapStatus::Completed,
                    },
                )
                .unwrap();
        }
        let best = laps
            .iter()
            .filter(|(_, v)| *v)
            .map(|(t, _)| *t)
            .reduce(f64::min);
        store
            .update_session(
                session,
                &SessionUpdate {
                    total_laps: Some(laps.len() as u32),
                    best_lap_time: best,
                    end_time: Some(start + Duration::from_secs(600)),
                },
            )
            .unwrap();
        session
    }

    #[test]
    fn test_track_history_keeps_last_races() {
        let mut store = InMemoryStore::new();
        session_with_laps(&mut store, 0, &[(120., true), (119., true), (118., true)]);
        session_with_laps(&mut store, 100, &[(117., true)]);
        let second = session_with_laps(&mut store, 200, &[(121., true), (116., false), (119.5, true)]);
        let third = session_with_laps(&mut store, 300, &[(118.5, true), (118.2, true), (118.9, true)]);
        let fourth = session_with_laps(&mut store, 400, &[(119., true), (119.1, true), (119.2, true)]);

        let history = track_history(&store, "ks_silverstone@gp", None, 3).unwrap();
        assert!(history.available);
        let ids: Vec<SessionId> = history.sessions.iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec![second, third, fourth]);
        assert_eq!(history.best_session, Some(third));

        let second_summary = &history.sessions[0];
        assert_eq!(second_summary.off_track_laps, 1);
        assert_eq!(second_summary.avg_speed, Some(161.));
        assert_eq!(second_summary.pace, vec![(1, 121.), (2, 116.), (3, 119.5)]);
    }

    #[test]
    fn test_track_history_unavailable_without_races() {
        let mut store = InMemoryStore::new();
        session_with_laps(&mut store, 0, &[(120., true)]);
        let history = track_history(&store, "ks_silverstone@gp", Some("ks_mclaren_650_gt3"), 3).unwrap();
        assert!(!history.available);
        assert!(history.message.is_some());
        assert!(history.sessions.is_empty());

        let other_car = track_history(&store, "ks_silverstone@gp", Some("other"), 3).unwrap();
        assert!(!other_car.available);
    }

    #[test]
    fn test_recent_laps_consistency() {
        let mut store = InMemoryStore::new();
        let session = session_with_laps(
            &mut store,
            0,
            &[(130., true), (99., true), (101., false), (100., true)],
        );
        let recent = recent_laps(&store, session, 3).unwrap();
        assert!(recent.available);
        let numbers: Vec<u32> = recent.laps.iter().map(|l| l.lap_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        let best = recent.laps.iter().find(|l| l.is_best).unwrap();
        assert_eq!(best.lap_time, 99.);
        assert_eq!(recent.best_lap_id, Some(best.lap_id));
        assert_eq!(recent.std_dev, 0.816);
        assert_eq!(recent.consistency_score, 99.2);
    }

    #[test]
    fn test_recent_laps_single_lap_is_fully_consistent() {
        let mut store = InMemoryStore::new();
        let session = session_with_laps(&mut store, 0, &[(100., false)]);
        let recent = recent_laps(&store, session, 3).unwrap();
        assert_eq!(recent.consistency_score, 100.);
        assert_eq!(recent.best_lap_id, None);
    }

    #[test]
    fn test_recent_laps_ignores_provisional() {
        let mut store = InMemoryStore::new();
        let session = session_with_laps(&mut store, 0, &[]);
        store.create_lap(session, 1, 0., true, 0., 0.).unwrap();
        let recent = recent_laps(&store, session, 3).unwrap();
        assert!(!recent.available);
    }
}
