// End-to-end runs of recorded snapshot streams through the collector, the
// tracker and the file store, checked against what ends up on disk.

use std::{
    sync::{Arc, atomic::AtomicBool, mpsc},
    thread,
    time::Duration,
};

use lapcoach::{
    CoachConfig, FileBasedStore, LapSessionTracker, LiveEvent, SessionAnalysis, SourceSnapshot,
    TelemetryStore,
    analysis::{self, AnalysisOutcome},
    store::{LapStatus, SessionId},
    telemetry::{self, MockSampleSource, SessionKind, SimStatus, Wheels},
    writer,
};
use tempfile::TempDir;

const LAP_SAMPLES: usize = 200;

/// A lap to generate: lap time, apex speed of both corners, and whether the
/// car puts four wheels off in the second corner.
struct LapPlan {
    lap_time_ms: i32,
    apex_kmh: f32,
    off_track: bool,
}

fn plan(lap_time_ms: i32, apex_kmh: f32, off_track: bool) -> LapPlan {
    LapPlan {
        lap_time_ms,
        apex_kmh,
        off_track,
    }
}

/// One lap of a circuit with a right hander and a left hander, sampled at
/// 10 Hz.
fn lap(
    kind: SessionKind,
    session_index: i32,
    completed_laps: i32,
    last_lap_time_ms: i32,
    lap: &LapPlan,
) -> Vec<SourceSnapshot> {
    (0..LAP_SAMPLES)
        .map(|i| {
            let (g_lat, steering_rad, speed_kmh, throttle) = match i {
                60..90 => (1.2, 0.2, lap.apex_kmh + (i as f32 - 75.).abs() * 3., 0.3),
                150..180 => (-1.2, -0.2, lap.apex_kmh + (i as f32 - 165.).abs() * 3., 0.3),
                _ => (0.02, 0.0, 220., 1.0),
            };
            let off = lap.off_track && (150..180).contains(&i);
            SourceSnapshot {
                status: SimStatus::Live,
                session_kind: kind,
                session_index,
                track_name: "spa".to_string(),
                car_name: "ks_porsche_911_gt3_r_2016".to_string(),
                completed_laps,
                last_lap_time_ms,
                is_valid_lap: !off,
                current_sector_index: (i * 3 / LAP_SAMPLES) as i32,
                last_sector_time_ms: 30_000 + completed_laps * 100,
                tires_out: if off { 4 } else { 0 },
                speed_kmh,
                throttle,
                steering_rad,
                g_lat,
                tire_temp: Wheels::splat(85.),
                timestamp_s: i as f64 * 0.1,
                ..Default::default()
            }
        })
        .collect()
}

/// A whole session: every planned lap, the crossing that completes the last
/// one, then the simulator leaving the session.
fn session(kind: SessionKind, session_index: i32, laps: &[LapPlan]) -> Vec<SourceSnapshot> {
    let mut snapshots = Vec::new();
    let mut last_lap_time_ms = 0;
    for (completed, planned) in laps.iter().enumerate() {
        snapshots.extend(lap(kind, session_index, completed as i32, last_lap_time_ms, planned));
        last_lap_time_ms = planned.lap_time_ms;
    }
    let crossing = lap(
        kind,
        session_index,
        laps.len() as i32,
        last_lap_time_ms,
        &plan(0, 100., false),
    );
    snapshots.push(crossing[0].clone());
    snapshots.push(SourceSnapshot::default());
    snapshots
}

fn replay(dir: &TempDir, snapshots: Vec<SourceSnapshot>) -> Vec<LiveEvent> {
    let store = FileBasedStore::new(dir.path().to_path_buf()).unwrap();
    let mut tracker = LapSessionTracker::new(store, CoachConfig::default());
    let (tx, rx) = mpsc::channel();
    telemetry::collect_telemetry(
        MockSampleSource::from_snapshots(snapshots),
        &mut tracker,
        tx,
        None,
        Arc::new(AtomicBool::new(true)),
        Duration::ZERO,
    )
    .unwrap();
    rx.try_iter().collect()
}

fn completions(events: &[LiveEvent]) -> Vec<(u32, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            LiveEvent::LapCompleted {
                lap_number,
                is_valid,
                ..
            } => Some((*lap_number, *is_valid)),
            _ => None,
        })
        .collect()
}

fn session_analysis(events: &[LiveEvent]) -> &SessionAnalysis {
    events
        .iter()
        .find_map(|e| match e {
            LiveEvent::SessionEnded { analysis, .. } => Some(analysis.as_ref()),
            _ => None,
        })
        .expect("session should have ended")
}

#[test]
fn test_race_is_recorded_and_coached() {
    let dir = TempDir::new().unwrap();
    let events = replay(
        &dir,
        session(
            SessionKind::Race,
            0,
            &[
                plan(92_000, 80., false),
                plan(91_500, 85., false),
                plan(93_000, 70., true),
            ],
        ),
    );

    assert_eq!(completions(&events), vec![(1, true), (2, true), (3, false)]);

    let analysis = session_analysis(&events);
    assert_eq!(analysis.outcome, AnalysisOutcome::Complete);
    assert!(analysis.analysis_complete);
    assert_eq!(analysis.best_lap_time, Some(91.5));
    assert!(analysis.records_broken.lap);
    assert!(analysis.recommendations[0].starts_with("New personal records set!"));
    assert!(
        analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("Corner 1: your apex speed was 15.0 km/h slower"))
    );
    assert!(
        analysis
            .recommendations
            .iter()
            .any(|r| r.contains("went off track"))
    );
    // straight, right, straight, left, straight
    assert_eq!(analysis.sections.len(), 5);
    assert!(analysis.sections[3].is_off_track_corner());

    // everything survives reopening the store
    let store = FileBasedStore::new(dir.path().to_path_buf()).unwrap();
    let laps = store.session_laps(SessionId(1)).unwrap();
    let statuses: Vec<LapStatus> = laps.iter().map(|l| l.status).collect();
    assert_eq!(
        statuses,
        vec![
            LapStatus::Completed,
            LapStatus::Completed,
            LapStatus::Completed,
            LapStatus::Incomplete
        ]
    );
    assert_eq!(store.read_samples(laps[0].id).unwrap().len(), LAP_SAMPLES);
    assert_eq!(laps[1].lap_time, 91.5);
    assert_eq!(laps[1].max_speed, 220.);
    assert!(laps[1].sector_times.iter().all(Option::is_some));

    let session = store.session(SessionId(1)).unwrap();
    assert_eq!(session.total_laps, 3);
    assert!(session.end_time.is_some());
    assert!(store.analysis(SessionId(1)).unwrap().is_some());

    let record = store
        .lap_record("spa", "ks_porsche_911_gt3_r_2016")
        .unwrap()
        .unwrap();
    assert_eq!(record.best_lap_time, 91.5);

    let lap_analysis = analysis::analyze_lap(&store, laps[2].id, &CoachConfig::default()).unwrap();
    assert!(!lap_analysis.is_valid);
    assert_eq!(lap_analysis.sections.len(), 5);
}

#[test]
fn test_slower_session_keeps_records() {
    let dir = TempDir::new().unwrap();
    replay(
        &dir,
        session(
            SessionKind::Race,
            0,
            &[
                plan(92_000, 80., false),
                plan(91_500, 85., false),
                plan(91_800, 84., false),
            ],
        ),
    );
    let events = replay(
        &dir,
        session(
            SessionKind::Race,
            0,
            &[
                plan(95_000, 80., false),
                plan(94_000, 80., false),
                plan(94_500, 80., false),
            ],
        ),
    );

    let analysis = session_analysis(&events);
    assert_eq!(analysis.session_id, SessionId(2));
    assert!(!analysis.records_broken.lap);
    assert!(
        !analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("New personal records"))
    );

    let store = FileBasedStore::new(dir.path().to_path_buf()).unwrap();
    let record = store
        .lap_record("spa", "ks_porsche_911_gt3_r_2016")
        .unwrap()
        .unwrap();
    assert_eq!(record.best_lap_time, 91.5);
    assert_eq!(record.session_id, SessionId(1));

    let history = analysis::track_history(&store, "spa", None, 5).unwrap();
    assert_eq!(history.sessions.len(), 2);
    assert_eq!(history.best_session, Some(SessionId(1)));

    let recent = analysis::recent_laps(&store, SessionId(2), 5).unwrap();
    assert_eq!(recent.laps.len(), 3);
    assert_eq!(recent.best_lap_id, Some(recent.laps[1].lap_id));
}

#[test]
fn test_practice_out_lap_is_not_a_lap() {
    let dir = TempDir::new().unwrap();
    let events = replay(
        &dir,
        session(
            SessionKind::Practice,
            0,
            &[
                plan(40_000, 90., false),
                plan(92_000, 80., false),
                plan(91_000, 82., false),
            ],
        ),
    );

    assert_eq!(completions(&events), vec![(1, true), (2, true)]);

    let store = FileBasedStore::new(dir.path().to_path_buf()).unwrap();
    let laps = store.session_laps(SessionId(1)).unwrap();
    let numbers: Vec<(u32, f64)> = laps.iter().map(|l| (l.lap_number, l.lap_time)).collect();
    assert_eq!(numbers, vec![(1, 92.), (2, 91.), (3, 0.)]);
    assert_eq!(store.read_samples(laps[0].id).unwrap().len(), LAP_SAMPLES);
}

#[test]
fn test_restart_closes_session_before_the_next_one() {
    let dir = TempDir::new().unwrap();
    let mut snapshots = session(SessionKind::Qualify, 0, &[plan(93_000, 80., false)]);
    // driver restarts instead of leaving: drop the exit and start over
    snapshots.pop();
    snapshots.extend(session(SessionKind::Qualify, 1, &[plan(92_000, 80., false)]));
    let events = replay(&dir, snapshots);

    let lifecycle: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            LiveEvent::SessionStarted { .. } => Some("start"),
            LiveEvent::SessionEnded { .. } => Some("end"),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec!["start", "end", "start", "end"]);

    let store = FileBasedStore::new(dir.path().to_path_buf()).unwrap();
    for session_id in [SessionId(1), SessionId(2)] {
        let laps = store.session_laps(session_id).unwrap();
        assert!(laps.iter().all(|l| l.status != LapStatus::Provisional));
        assert_eq!(laps[0].status, LapStatus::Completed);
    }
}

#[test]
fn test_event_log_has_one_line_per_event() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("events.jsonl");
    let store = FileBasedStore::new(dir.path().join("data")).unwrap();
    let mut tracker = LapSessionTracker::new(store, CoachConfig::default());

    let (tx, rx) = mpsc::channel();
    let (writer_tx, writer_rx) = mpsc::channel();
    let path = log_path.clone();
    let writer = thread::spawn(move || writer::write_events(&path, writer_rx));
    telemetry::collect_telemetry(
        MockSampleSource::from_snapshots(session(
            SessionKind::Hotlap,
            0,
            &[plan(90_000, 90., false)],
        )),
        &mut tracker,
        tx,
        Some(writer_tx),
        Arc::new(AtomicBool::new(true)),
        Duration::ZERO,
    )
    .unwrap();
    writer.join().unwrap().unwrap();

    let broadcast = rx.try_iter().count();
    let logged = std::fs::read_to_string(&log_path).unwrap().lines().count();
    assert_eq!(logged, broadcast);
}
