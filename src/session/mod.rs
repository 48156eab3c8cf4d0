//! Session and lap tracking over the raw snapshot stream.
//!
//! [`LapSessionTracker`] consumes one [`SourceSnapshot`] at a time and turns
//! the simulator's counters into Session and Lap rows in a [`TelemetryStore`],
//! together with the live events a front end needs. It is driven by a single
//! loop, see [`crate::telemetry::collect_telemetry`].

mod buffer;

use std::{mem, time::SystemTime};

use log::{debug, error, info, warn};

use buffer::{SampleBuffer, SampleRate};

use crate::{
    CoachError,
    analysis::{self, SessionAnalysis, sections},
    config::CoachConfig,
    store::{LapId, LapStatus, LapUpdate, SessionId, SessionUpdate, TelemetryStore},
    telemetry::{LiveEvent, LiveSample, SessionKind, SimStatus, SourceSnapshot, ms_to_seconds},
};

#[derive(Debug, Default)]
pub enum TrackerState {
    #[default]
    Idle,
    InSession(Box<ActiveSession>),
}

/// Everything the tracker knows about the session being driven.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub track_id: String,
    pub vehicle_id: String,
    pub kind: SessionKind,
    pub session_index: i32,
    /// Laps finalized so far, counted from 0. Practice starts at -1 because
    /// the drive from the pits to the line is not a lap.
    pub current_lap_number: i32,
    /// Display number (1-based) of the lap being driven
    pub lap_number: u32,
    /// Row of the lap being driven. `None` only while the store refuses to
    /// create it.
    pub current_lap_id: Option<LapId>,
    pub last_completed_lap_counter: i32,
    pub sector_times: [Option<f64>; 3],
    /// 0-based sector of the previous snapshot, -1 at the start of a lap
    pub last_sector_index: i32,
    /// Latched: once false it stays false until the lap ends
    pub current_lap_valid: bool,
    pub car_has_moved: bool,
    pub ignore_first_lap: bool,
    /// Laps closed with a lap time
    pub completed_laps: u32,
    /// Fastest valid lap driven in this session
    pub best_lap_time: Option<f64>,
}

impl ActiveSession {
    fn new(session_id: SessionId, snapshot: &SourceSnapshot) -> Self {
        let practice = snapshot.session_kind.starts_mid_track();
        Self {
            session_id,
            track_id: snapshot.track_id(),
            vehicle_id: snapshot.car_name.clone(),
            kind: snapshot.session_kind,
            session_index: snapshot.session_index,
            current_lap_number: if practice { -1 } else { 0 },
            lap_number: 1,
            current_lap_id: None,
            last_completed_lap_counter: snapshot.completed_laps,
            sector_times: [None; 3],
            last_sector_index: -1,
            current_lap_valid: true,
            car_has_moved: false,
            ignore_first_lap: practice,
            completed_laps: 0,
            best_lap_time: None,
        }
    }

    fn reset_lap_state(&mut self) {
        self.sector_times = [None; 3];
        self.last_sector_index = -1;
        self.current_lap_valid = true;
    }

    fn is_restarted_by(&self, snapshot: &SourceSnapshot) -> bool {
        snapshot.session_index != self.session_index || snapshot.session_kind != self.kind
    }

    /// Store the time of the sector the car just left.
    fn track_sector(&mut self, snapshot: &SourceSnapshot) {
        let current = snapshot.current_sector_index;
        if current != self.last_sector_index && self.last_sector_index >= 0 {
            let finished = self.last_sector_index as usize;
            if let Some(slot) = self.sector_times.get_mut(finished) {
                if snapshot.last_sector_time_ms > 0 {
                    let time = ms_to_seconds(snapshot.last_sector_time_ms);
                    debug!("Sector {} of lap {}: {:.3}s", finished + 1, self.lap_number, time);
                    *slot = Some(time);
                }
            }
        }
        self.last_sector_index = current;
    }
}

fn storage_failure(lap_id: Option<LapId>, cause: &CoachError) -> LiveEvent {
    match lap_id {
        Some(lap_id) => error!("Storage failure for lap {}: {}", lap_id, cause),
        None => error!("Storage failure: {}", cause),
    }
    LiveEvent::StorageError {
        lap_id,
        reason: cause.to_string(),
    }
}

pub struct LapSessionTracker<S> {
    store: S,
    config: CoachConfig,
    state: TrackerState,
    buffer: SampleBuffer,
    rate: SampleRate,
}

impl<S: TelemetryStore> LapSessionTracker<S> {
    pub fn new(store: S, config: CoachConfig) -> Self {
        Self {
            buffer: SampleBuffer::new(config.flush_batch_size),
            store,
            config,
            state: TrackerState::Idle,
            rate: SampleRate::new(),
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn active_session(&self) -> Option<&ActiveSession> {
        match &self.state {
            TrackerState::InSession(active) => Some(active),
            TrackerState::Idle => None,
        }
    }

    pub fn is_in_session(&self) -> bool {
        self.active_session().is_some()
    }

    /// Samples waiting to be written to the store.
    pub fn pending_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Feed the next snapshot and collect the events it causes, in order.
    pub fn process(&mut self, snapshot: &SourceSnapshot) -> Vec<LiveEvent> {
        let mut events = Vec::new();

        let restarted = snapshot.is_in_session()
            && self
                .active_session()
                .is_some_and(|active| active.is_restarted_by(snapshot));
        if restarted {
            info!(
                "Session changed to {} #{}, closing the previous one",
                snapshot.session_kind, snapshot.session_index
            );
            events.extend(self.end_session());
        }

        if !snapshot.is_in_session() {
            if self.is_in_session() {
                info!("Simulator left the session ({:?})", snapshot.status);
                events.extend(self.end_session());
            }
            return events;
        }

        let mut active = match mem::take(&mut self.state) {
            TrackerState::InSession(active) => active,
            TrackerState::Idle => match self.start_session(snapshot) {
                Ok(active) => {
                    events.push(LiveEvent::SessionStarted {
                        session_id: active.session_id,
                        track: active.track_id.clone(),
                        vehicle: active.vehicle_id.clone(),
                        kind: active.kind,
                    });
                    active
                }
                Err(e) => {
                    // stay idle and try again with the next snapshot
                    events.push(storage_failure(None, &e));
                    events.push(LiveEvent::Sample(Box::new(LiveSample {
                        lap_id: None,
                        lap_number: 1,
                        recorded: false,
                        lap_valid: snapshot.is_valid_lap,
                        sample_rate_hz: self.rate.observe(snapshot.timestamp_s),
                        snapshot: snapshot.clone(),
                    })));
                    return events;
                }
            },
        };
        events.extend(self.track(&mut active, snapshot));
        self.state = TrackerState::InSession(active);
        events
    }

    /// The source went away: close the running session with what was stored.
    pub fn source_lost(&mut self) -> Vec<LiveEvent> {
        if let Some(active) = self.active_session() {
            warn!("Source lost during session {}", active.session_id);
        }
        self.end_session()
    }

    /// Close the running session and make a last attempt at writing anything
    /// still buffered.
    pub fn shutdown(&mut self) -> Vec<LiveEvent> {
        let mut events = self.end_session();
        if self.buffer.len() > 0 {
            events.extend(self.flush());
        }
        if self.buffer.len() > 0 || self.buffer.dropped() > 0 {
            warn!(
                "{} samples could not be stored, {} dropped earlier",
                self.buffer.len(),
                self.buffer.dropped()
            );
        }
        events
    }

    fn start_session(&mut self, snapshot: &SourceSnapshot) -> Result<Box<ActiveSession>, CoachError> {
        let session_id = self.store.create_session(
            &snapshot.track_id(),
            &snapshot.car_name,
            snapshot.session_kind,
            SystemTime::now(),
        )?;
        let active = Box::new(ActiveSession::new(session_id, snapshot));
        info!(
            "Session {} started: {} at {} in {}",
            session_id, active.kind, active.track_id, active.vehicle_id
        );
        if active.ignore_first_lap {
            debug!("Practice session, the first lap completion will be ignored");
        }
        self.rate = SampleRate::new();
        Ok(active)
    }

    fn track(&mut self, active: &mut ActiveSession, snapshot: &SourceSnapshot) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        if active.current_lap_id.is_none() {
            if let Err(event) = self.ensure_lap_row(active) {
                events.push(event);
            }
        }

        if !active.car_has_moved && snapshot.speed_kmh > self.config.movement_speed_kmh {
            info!("Car is moving, recording from lap {}", active.lap_number);
            active.car_has_moved = true;
        }

        let mut recorded = false;
        if active.car_has_moved {
            active.track_sector(snapshot);

            if snapshot.completed_laps > active.last_completed_lap_counter {
                events.extend(self.complete_lap(active, snapshot));
            }
            active.last_completed_lap_counter = snapshot.completed_laps;

            if !snapshot.is_valid_lap && active.current_lap_valid {
                debug!("Lap {} invalidated", active.lap_number);
                active.current_lap_valid = false;
            }

            // nothing is kept of the drive to the line in practice, nor while paused
            if snapshot.status == SimStatus::Live && !active.ignore_first_lap {
                match self.ensure_lap_row(active) {
                    Ok(lap_id) => {
                        self.buffer.push(snapshot.to_sample(lap_id));
                        recorded = true;
                    }
                    Err(event) => events.push(event),
                }
                if self.buffer.is_due() {
                    events.extend(self.flush());
                }
            }
        }

        events.push(LiveEvent::Sample(Box::new(LiveSample {
            lap_id: active.current_lap_id,
            lap_number: active.lap_number,
            recorded,
            lap_valid: active.current_lap_valid,
            sample_rate_hz: self.rate.observe(snapshot.timestamp_s),
            snapshot: snapshot.clone(),
        })));
        events
    }

    fn ensure_lap_row(&mut self, active: &mut ActiveSession) -> Result<LapId, LiveEvent> {
        if let Some(lap_id) = active.current_lap_id {
            return Ok(lap_id);
        }
        let lap_id = self
            .store
            .create_lap(active.session_id, active.lap_number, 0., true, 0., 0.)
            .map_err(|e| storage_failure(None, &e))?;
        debug!("Lap {} opened as {}", active.lap_number, lap_id);
        active.current_lap_id = Some(lap_id);
        Ok(lap_id)
    }

    fn flush(&mut self) -> Option<LiveEvent> {
        match self.buffer.flush(&mut self.store) {
            Ok(0) => None,
            Ok(written) => {
                debug!("Stored {} samples", written);
                None
            }
            Err(failed) => Some(storage_failure(Some(failed.lap_id), &failed.source)),
        }
    }

    fn complete_lap(&mut self, active: &mut ActiveSession, snapshot: &SourceSnapshot) -> Vec<LiveEvent> {
        if active.ignore_first_lap && active.current_lap_number == -1 {
            let dropped = active
                .current_lap_id
                .map_or(0, |lap_id| self.buffer.discard_lap(lap_id));
            info!(
                "Ignoring the first lap completion of the {} session ({} samples dropped)",
                active.kind, dropped
            );
            active.ignore_first_lap = false;
            active.reset_lap_state();
            return Vec::new();
        }

        let lap_time = snapshot.last_lap_time_s();
        let lap_number = active.lap_number;
        let is_valid = active.current_lap_valid;
        let status = match lap_time {
            Some(_) => LapStatus::Completed,
            None => {
                warn!("Lap {} ended without a lap time", lap_number);
                LapStatus::Incomplete
            }
        };

        let mut events = self.finalize_lap(active, lap_time.unwrap_or(0.), status);
        if let Some(time) = lap_time {
            active.completed_laps += 1;
            if is_valid && active.best_lap_time.is_none_or(|best| time < best) {
                active.best_lap_time = Some(time);
            }
            info!(
                "Lap {} completed in {:.3}s ({})",
                lap_number,
                time,
                if is_valid { "valid" } else { "invalid" }
            );
        }

        active.current_lap_number += 1;
        active.lap_number += 1;
        active.current_lap_id = None;
        active.reset_lap_state();
        if let Err(event) = self.ensure_lap_row(active) {
            events.push(event);
        }

        let best_lap_time = snapshot.best_lap_time_s().or(active.best_lap_time);
        let update = SessionUpdate {
            total_laps: Some(active.completed_laps),
            best_lap_time,
            end_time: None,
        };
        if let Err(e) = self.store.update_session(active.session_id, &update) {
            events.push(storage_failure(None, &e));
        }

        events.push(LiveEvent::LapCompleted {
            lap_number,
            lap_time: lap_time.unwrap_or(0.),
            is_valid,
            best_lap_time,
        });
        events
    }

    /// Close the current lap row with its statistics. Waits for every
    /// buffered batch of the lap before reading it back.
    fn finalize_lap(
        &mut self,
        active: &mut ActiveSession,
        lap_time: f64,
        status: LapStatus,
    ) -> Vec<LiveEvent> {
        let mut events: Vec<LiveEvent> = self.flush().into_iter().collect();
        let Some(lap_id) = active.current_lap_id else {
            return events;
        };

        let mut speeds: Vec<f32> = match self.store.read_samples(lap_id) {
            Ok(samples) => samples.iter().map(|s| s.speed).collect(),
            Err(e) => {
                warn!("Could not read back lap {}: {}", lap_id, e);
                Vec::new()
            }
        };
        speeds.extend(self.buffer.pending_for(lap_id).map(|s| s.speed));

        let update = LapUpdate {
            lap_time,
            max_speed: sections::peak(speeds.iter().copied()).unwrap_or(0.),
            avg_speed: sections::mean(speeds.iter().copied())
                .map(|speed| sections::round_to(speed, 2))
                .unwrap_or(0.),
            is_valid: active.current_lap_valid,
            sector_times: active.sector_times,
            status,
        };
        if let Err(e) = self.store.update_lap(lap_id, &update) {
            events.push(storage_failure(Some(lap_id), &e));
        }
        events
    }

    fn end_session(&mut self) -> Vec<LiveEvent> {
        let TrackerState::InSession(mut active) = mem::take(&mut self.state) else {
            return Vec::new();
        };
        let session_id = active.session_id;

        let mut events = self.finalize_lap(&mut active, 0., LapStatus::Incomplete);
        let update = SessionUpdate {
            total_laps: Some(active.completed_laps),
            best_lap_time: None,
            end_time: Some(SystemTime::now()),
        };
        if let Err(e) = self.store.update_session(session_id, &update) {
            events.push(storage_failure(None, &e));
        }

        let analysis = analysis::analyze_session(&mut self.store, session_id, &self.config)
            .unwrap_or_else(|e| {
                error!("Analysis of session {} failed: {}", session_id, e);
                SessionAnalysis::failed(session_id, &e)
            });
        info!(
            "Session {} ended after {} laps",
            session_id, active.completed_laps
        );
        events.push(LiveEvent::SessionEnded {
            session_id,
            analysis: Box::new(analysis),
        });
        events
    }
}
