use std::path::Path;

use log::{debug, warn};
use serde_jsonlines::json_lines;

use crate::CoachError;

use super::SourceSnapshot;

/// A source of raw simulator snapshots.
///
/// # Lifecycle
///
/// 1. Call `connect()` until it succeeds; a missing simulator is reported as
///    `SourceUnavailable` and the caller retries at its own pace
/// 2. Call `snapshot()` once per sampling tick
/// 3. Poll `is_connected()` to notice the simulator going away
pub trait SampleSource {
    /// Establish the connection to the simulator.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` when the simulator is not running.
    fn connect(&mut self) -> Result<(), CoachError>;

    fn is_connected(&self) -> bool;

    /// Read the current simulator state.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` if the connection dropped,
    /// `MalformedSample` for a snapshot that could not be decoded (the next
    /// call moves on) and `SourceExhausted` when a recorded source has
    /// nothing left to replay.
    fn snapshot(&mut self) -> Result<SourceSnapshot, CoachError>;
}

/// A sample source replaying recorded or generated snapshots.
///
/// Used for tests, benchmarks and the `replay` command.
#[derive(Debug, Default)]
pub struct MockSampleSource {
    cur_tick: usize,
    /// Recorded lines that failed to decode are kept in place as errors
    snapshots: Vec<Result<SourceSnapshot, String>>,
    connected: bool,
    failed_connects: usize,
    disconnect_at: Option<usize>,
}

impl MockSampleSource {
    pub fn from_snapshots(snapshots: Vec<SourceSnapshot>) -> Self {
        Self {
            snapshots: snapshots.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    /// Load snapshots from a JSON Lines file, one `SourceSnapshot` per line.
    ///
    /// A line that does not decode is replayed as a `MalformedSample` at its
    /// position instead of rejecting the whole recording.
    ///
    /// # Errors
    ///
    /// Returns `SourceUnavailable` if the file cannot be opened or read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoachError> {
        let path = path.as_ref();
        let lines = json_lines::<SourceSnapshot, _>(path).map_err(|e| {
            CoachError::SourceUnavailable {
                reason: format!("could not open {}: {}", path.display(), e),
            }
        })?;

        let mut snapshots = Vec::new();
        for (number, line) in lines.enumerate() {
            match line {
                Ok(snapshot) => snapshots.push(Ok(snapshot)),
                // decode errors carry the serde_json error; the reader has
                // already moved past the line
                Err(e) if e.get_ref().is_some_and(|inner| inner.is::<serde_json::Error>()) => {
                    warn!("Line {} of {} is not a snapshot: {}", number + 1, path.display(), e);
                    snapshots.push(Err(format!("line {}: {}", number + 1, e)));
                }
                Err(e) => {
                    return Err(CoachError::SourceUnavailable {
                        reason: format!("could not read {}: {}", path.display(), e),
                    });
                }
            }
        }
        debug!("Loaded {} snapshots from {}", snapshots.len(), path.display());
        Ok(Self {
            snapshots,
            ..Default::default()
        })
    }

    /// The first `attempts` calls to `connect()` fail as if the simulator
    /// was not running yet.
    pub fn with_failed_connects(mut self, attempts: usize) -> Self {
        self.failed_connects = attempts;
        self
    }

    /// Drop the connection once `tick` snapshots have been served. The next
    /// `connect()` resumes the replay where it stopped.
    pub fn with_disconnect_at(mut self, tick: usize) -> Self {
        self.disconnect_at = Some(tick);
        self
    }

    pub fn remaining(&self) -> usize {
        self.snapshots.len().saturating_sub(self.cur_tick)
    }
}

impl SampleSource for MockSampleSource {
    fn connect(&mut self) -> Result<(), CoachError> {
        if self.failed_connects > 0 {
            self.failed_connects -= 1;
            return Err(CoachError::SourceUnavailable {
                reason: "simulator is not running".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn snapshot(&mut self) -> Result<SourceSnapshot, CoachError> {
        if self.disconnect_at == Some(self.cur_tick) {
            self.disconnect_at = None;
            self.connected = false;
        }
        if !self.connected {
            return Err(CoachError::SourceUnavailable {
                reason: "not connected".to_string(),
            });
        }

        let entry = self
            .snapshots
            .get(self.cur_tick)
            .cloned()
            .ok_or(CoachError::SourceExhausted)?;
        self.cur_tick += 1;
        entry.map_err(|reason| CoachError::MalformedSample { reason })
    }
}
