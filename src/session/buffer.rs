use log::warn;
use simple_moving_average::{SMA, SumTreeSMA};

use crate::{
    CoachError,
    store::{LapId, TelemetryStore},
    telemetry::Sample,
};

const RATE_WINDOW: usize = 20;
/// How many batches may wait for a failing store before the oldest samples
/// are dropped.
const MAX_PENDING_BATCHES: usize = 20;

/// A batch the store refused. Its samples stay buffered.
#[derive(Debug)]
pub(crate) struct FailedBatch {
    pub lap_id: LapId,
    pub source: CoachError,
}

/// Write-behind buffer between the tracker and the store.
///
/// Samples of several laps can sit in the buffer at once (a failed batch is
/// kept while the next lap starts). They are held in arrival order and written
/// as one append per run of consecutive samples of the same lap, so every lap
/// receives its batches in timestamp order.
///
/// A flush is due once a batch worth of samples arrived since the last
/// attempt, so a failing store is retried once per batch. While it keeps
/// failing the buffer holds at most `MAX_PENDING_BATCHES` batches and
/// drops the oldest samples beyond that.
#[derive(Debug)]
pub(crate) struct SampleBuffer {
    pending: Vec<Sample>,
    batch_size: usize,
    arrived_since_flush: usize,
    dropped: usize,
}

impl SampleBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(batch_size),
            batch_size: batch_size.max(1),
            arrived_since_flush: 0,
            dropped: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.batch_size * MAX_PENDING_BATCHES
    }

    pub fn push(&mut self, sample: Sample) {
        if self.pending.len() >= self.capacity() {
            if self.dropped == 0 {
                warn!(
                    "{} samples waiting for the store, dropping the oldest until it recovers",
                    self.pending.len()
                );
            }
            self.pending.remove(0);
            self.dropped += 1;
        }
        self.pending.push(sample);
        self.arrived_since_flush += 1;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_due(&self) -> bool {
        self.arrived_since_flush >= self.batch_size
    }

    /// Samples lost to a full buffer since the store last accepted a flush.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn pending_for(&self, lap_id: LapId) -> impl Iterator<Item = &Sample> {
        self.pending.iter().filter(move |s| s.lap_id == lap_id)
    }

    /// Drop the unwritten samples of a lap, returning how many were dropped.
    pub fn discard_lap(&mut self, lap_id: LapId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|s| s.lap_id != lap_id);
        before - self.pending.len()
    }

    /// Write everything buffered, oldest first. Stops at the first failed
    /// append; that run and everything after it stays for the next flush,
    /// which is due again after another batch arrived.
    pub fn flush<S: TelemetryStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> Result<usize, FailedBatch> {
        self.arrived_since_flush = 0;
        let mut written = 0;
        while let Some(first) = self.pending.first() {
            let lap_id = first.lap_id;
            let run = self
                .pending
                .iter()
                .take_while(|s| s.lap_id == lap_id)
                .count();
            store
                .append_samples(lap_id, &self.pending[..run])
                .map_err(|source| FailedBatch { lap_id, source })?;
            self.pending.drain(..run);
            written += run;
        }
        if self.dropped > 0 {
            warn!("{} samples were dropped while the store was failing", self.dropped);
            self.dropped = 0;
        }
        Ok(written)
    }
}

/// Smoothed sampling rate of the source, from the lap clock of its snapshots.
pub(crate) struct SampleRate {
    intervals: SumTreeSMA<f64, f64, RATE_WINDOW>,
    last_timestamp: Option<f64>,
}

impl SampleRate {
    pub fn new() -> Self {
        Self {
            intervals: SumTreeSMA::new(),
            last_timestamp: None,
        }
    }

    /// Feed the timestamp of the next snapshot and get the current rate in Hz.
    /// The lap clock restarts every lap and stops while paused, so only
    /// positive intervals count.
    pub fn observe(&mut self, timestamp: f64) -> Option<f64> {
        if let Some(previous) = self.last_timestamp.replace(timestamp) {
            let interval = timestamp - previous;
            if interval > 0. {
                self.intervals.add_sample(interval);
            }
        }
        if self.intervals.get_num_samples() == 0 {
            return None;
        }
        let average = self.intervals.get_average();
        (average > 0.).then(|| 1. / average)
    }
}
