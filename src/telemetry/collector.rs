use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    CoachError,
    session::LapSessionTracker,
    store::TelemetryStore,
};

use super::{LiveEvent, producer::SampleSource};

/// Where live events go: the display channel, and optionally the event log
/// writer.
struct Broadcast {
    event_sender: Sender<LiveEvent>,
    event_writer_sender: Option<Sender<LiveEvent>>,
}

impl Broadcast {
    /// Forward `events` in order. A writer that stopped listening is dropped
    /// with a warning; only a closed display channel is an error.
    fn send(&mut self, events: Vec<LiveEvent>) -> Result<(), CoachError> {
        for event in events {
            if let Some(writer_sender) = &self.event_writer_sender {
                if let Err(e) = writer_sender.send(event.clone()) {
                    warn!("Event writer stopped, events are no longer logged: {}", e);
                    self.event_writer_sender = None;
                }
            }
            self.event_sender.send(event)?;
        }
        Ok(())
    }
}

/// Poll `source` every `interval` and feed each snapshot through `tracker`,
/// forwarding the resulting events.
///
/// A missing source is retried forever and a malformed snapshot is skipped.
/// Losing the connection closes the running session. The loop ends when a
/// recorded source runs out, `running` is cleared or an error stops it;
/// every way out shuts the tracker down so the last session is finalized and
/// analyzed.
pub fn collect_telemetry<S: TelemetryStore>(
    source: impl SampleSource,
    tracker: &mut LapSessionTracker<S>,
    event_sender: Sender<LiveEvent>,
    event_writer_sender: Option<Sender<LiveEvent>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) -> Result<(), CoachError> {
    let mut broadcast = Broadcast {
        event_sender,
        event_writer_sender,
    };

    let polled = poll(source, tracker, &mut broadcast, &running, interval);
    if let Err(e) = &polled {
        error!("Telemetry collection stopped: {}", e);
    }
    let shutdown = broadcast.send(tracker.shutdown());
    polled.and(shutdown)
}

fn poll<S: TelemetryStore>(
    mut source: impl SampleSource,
    tracker: &mut LapSessionTracker<S>,
    broadcast: &mut Broadcast,
    running: &AtomicBool,
    interval: Duration,
) -> Result<(), CoachError> {
    while running.load(Ordering::SeqCst) {
        if !source.is_connected() {
            match source.connect() {
                Ok(()) => {
                    info!("Connected to the telemetry source");
                    broadcast.send(vec![LiveEvent::SourceConnected])?;
                }
                Err(e) => {
                    debug!("Telemetry source not available yet: {}", e);
                    thread::sleep(interval);
                    continue;
                }
            }
        }

        match source.snapshot() {
            Ok(snapshot) => match snapshot.validate() {
                Ok(()) => broadcast.send(tracker.process(&snapshot))?,
                Err(e) => warn!("Skipping sample: {}", e),
            },
            Err(CoachError::SourceExhausted) => {
                info!("Telemetry source has no more samples");
                break;
            }
            Err(CoachError::MalformedSample { reason }) => {
                warn!("Skipping unreadable sample: {}", reason);
            }
            Err(e @ CoachError::SourceUnavailable { .. }) => {
                warn!("Telemetry source lost: {}", e);
                let mut events = tracker.source_lost();
                events.push(LiveEvent::SourceDisconnected);
                broadcast.send(events)?;
            }
            Err(e) => return Err(e),
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::mpsc};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        config::CoachConfig,
        store::{InMemoryStore, LapStatus, SessionId},
        telemetry::{MockSampleSource, SessionKind, SimStatus, SourceSnapshot},
    };

    fn race_snapshot(timestamp_s: f64) -> SourceSnapshot {
        SourceSnapshot {
            status: SimStatus::Live,
            session_kind: SessionKind::Race,
            track_name: "spa".to_string(),
            car_name: "ks_porsche_911_gt3_r_2016".to_string(),
            speed_kmh: 180.,
            is_valid_lap: true,
            timestamp_s,
            ..Default::default()
        }
    }

    fn run(source: MockSampleSource) -> (Vec<LiveEvent>, LapSessionTracker<InMemoryStore>) {
        let mut tracker = LapSessionTracker::new(InMemoryStore::new(), CoachConfig::default());
        let (tx, rx) = mpsc::channel();
        collect_telemetry(
            source,
            &mut tracker,
            tx,
            None,
            Arc::new(AtomicBool::new(true)),
            Duration::ZERO,
        )
        .unwrap();
        (rx.try_iter().collect(), tracker)
    }

    #[test]
    fn test_retries_until_connected() {
        let source = MockSampleSource::from_snapshots(vec![race_snapshot(0.)]).with_failed_connects(3);
        let (events, _) = run(source);
        assert!(matches!(events[0], LiveEvent::SourceConnected));
        assert!(matches!(events[1], LiveEvent::SessionStarted { .. }));
        assert!(matches!(events.last(), Some(LiveEvent::SessionEnded { .. })));
    }

    #[test]
    fn test_malformed_sample_is_skipped() {
        let mut broken = race_snapshot(0.2);
        broken.speed_kmh = f32::NAN;
        let source = MockSampleSource::from_snapshots(vec![
            race_snapshot(0.1),
            broken,
            race_snapshot(0.3),
        ]);
        let (events, tracker) = run(source);

        let samples = events
            .iter()
            .filter(|e| matches!(e, LiveEvent::Sample(_)))
            .count();
        assert_eq!(samples, 2);
        let laps = tracker.store().session_laps(SessionId(1)).unwrap();
        assert_eq!(tracker.store().read_samples(laps[0].id).unwrap().len(), 2);
    }

    #[test]
    fn test_disconnect_closes_session() {
        let source = MockSampleSource::from_snapshots(vec![
            race_snapshot(0.1),
            race_snapshot(0.2),
            race_snapshot(0.3),
        ])
        .with_disconnect_at(2);
        let (events, tracker) = run(source);

        let order: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LiveEvent::SourceConnected => Some("connected"),
                LiveEvent::SourceDisconnected => Some("disconnected"),
                LiveEvent::SessionStarted { .. } => Some("start"),
                LiveEvent::SessionEnded { .. } => Some("end"),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec!["connected", "start", "end", "disconnected", "connected", "start", "end"]
        );
        let first = tracker.store().session_laps(SessionId(1)).unwrap();
        assert_eq!(first[0].status, LapStatus::Incomplete);
    }

    #[test]
    fn test_stopped_writer_does_not_stop_the_session() {
        let mut tracker = LapSessionTracker::new(InMemoryStore::new(), CoachConfig::default());
        let (tx, rx) = mpsc::channel();
        let (writer_tx, writer_rx) = mpsc::channel();
        drop(writer_rx);
        let snapshots = (0..20).map(|i| race_snapshot(i as f64 * 0.1)).collect();

        collect_telemetry(
            MockSampleSource::from_snapshots(snapshots),
            &mut tracker,
            tx,
            Some(writer_tx),
            Arc::new(AtomicBool::new(true)),
            Duration::ZERO,
        )
        .unwrap();

        let events: Vec<LiveEvent> = rx.try_iter().collect();
        let samples = events
            .iter()
            .filter(|e| matches!(e, LiveEvent::Sample(_)))
            .count();
        assert_eq!(samples, 20);
        assert!(matches!(events.last(), Some(LiveEvent::SessionEnded { .. })));

        assert!(!tracker.is_in_session());
        assert_eq!(tracker.pending_samples(), 0);
        let laps = tracker.store().session_laps(SessionId(1)).unwrap();
        assert!(laps.iter().all(|l| l.status != LapStatus::Provisional));
        assert_eq!(tracker.store().read_samples(laps[0].id).unwrap().len(), 20);
        assert!(tracker.store().session(SessionId(1)).unwrap().end_time.is_some());
    }

    #[test]
    fn test_closed_display_still_finalizes_the_session() {
        let mut tracker = LapSessionTracker::new(InMemoryStore::new(), CoachConfig::default());
        tracker.process(&race_snapshot(0.));
        let (tx, rx) = mpsc::channel();
        drop(rx);

        let result = collect_telemetry(
            MockSampleSource::from_snapshots(vec![race_snapshot(0.1)]),
            &mut tracker,
            tx,
            None,
            Arc::new(AtomicBool::new(true)),
            Duration::ZERO,
        );
        assert!(matches!(result, Err(CoachError::EventBroadcastError { .. })));

        assert!(!tracker.is_in_session());
        let laps = tracker.store().session_laps(SessionId(1)).unwrap();
        assert_eq!(laps[0].status, LapStatus::Incomplete);
        assert!(tracker.store().session(SessionId(1)).unwrap().end_time.is_some());
    }

    #[test]
    fn test_garbled_recording_line_is_skipped() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..3 {
            writeln!(file, "{}", serde_json::to_string(&race_snapshot(i as f64 * 0.1)).unwrap())
                .unwrap();
        }
        writeln!(file, "{{ garbled").unwrap();
        writeln!(file, "{}", serde_json::to_string(&race_snapshot(0.4)).unwrap()).unwrap();
        file.flush().unwrap();

        let (events, tracker) = run(MockSampleSource::from_file(file.path()).unwrap());
        let samples = events
            .iter()
            .filter(|e| matches!(e, LiveEvent::Sample(_)))
            .count();
        assert_eq!(samples, 4);
        let laps = tracker.store().session_laps(SessionId(1)).unwrap();
        assert_eq!(tracker.store().read_samples(laps[0].id).unwrap().len(), 4);
    }

    #[test]
    fn test_cleared_flag_stops_before_polling() {
        let mut tracker = LapSessionTracker::new(InMemoryStore::new(), CoachConfig::default());
        let (tx, rx) = mpsc::channel();
        let (writer_tx, writer_rx) = mpsc::channel();
        collect_telemetry(
            MockSampleSource::from_snapshots(vec![race_snapshot(0.)]),
            &mut tracker,
            tx,
            Some(writer_tx),
            Arc::new(AtomicBool::new(false)),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(writer_rx.try_iter().count(), 0);
    }
}
