use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::{debug, info, warn};
use serde_jsonlines::{append_json_lines, json_lines};

use crate::{
    CoachError,
    analysis::SessionAnalysis,
    config,
    telemetry::{Sample, SessionKind},
};

use super::{
    Lap, LapId, LapRecord, LapUpdate, SectionRecord, Session, SessionId, SessionUpdate,
    StoreIndex, TelemetryStore,
};

const INDEX_FILE_NAME: &str = "index.json";
const LAPS_DIR_NAME: &str = "laps";
const ANALYSES_DIR_NAME: &str = "analyses";

/// Replace `path` with `content` through a synced temporary file, so readers
/// see either the old or the new document.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), CoachError> {
    let temp_path = path.with_extension("json.tmp");
    {
        let mut temp_file =
            fs::File::create(&temp_path).map_err(|e| CoachError::StorageWriteFailure {
                reason: format!("could not create {}: {}", temp_path.display(), e),
            })?;
        temp_file
            .write_all(content)
            .and_then(|_| temp_file.sync_all())
            .map_err(|e| CoachError::StorageWriteFailure {
                reason: format!("could not write {}: {}", temp_path.display(), e),
            })?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CoachError::StorageWriteFailure {
            reason: format!("could not replace {}: {}", path.display(), e),
        }
    })
}

/// File-based telemetry store.
///
/// Sessions, laps and records live in one compact JSON index document that
/// is rewritten atomically after every change. Samples are appended to one
/// JSON Lines file per lap, and each session analysis is its own document.
pub struct FileBasedStore {
    storage_path: PathBuf,
    index: StoreIndex,
}

impl FileBasedStore {
    /// Open (or create) a store rooted at `storage_path`.
    pub fn new(storage_path: PathBuf) -> Result<Self, CoachError> {
        for dir in [LAPS_DIR_NAME, ANALYSES_DIR_NAME] {
            fs::create_dir_all(storage_path.join(dir)).map_err(|e| {
                CoachError::StorageWriteFailure {
                    reason: format!("could not create {}: {}", storage_path.display(), e),
                }
            })?;
        }

        let index_path = storage_path.join(INDEX_FILE_NAME);
        let index = if index_path.exists() {
            let content =
                fs::read_to_string(&index_path).map_err(|e| CoachError::StorageReadFailure {
                    reason: format!("could not read {}: {}", index_path.display(), e),
                })?;
            serde_json::from_str(&content).map_err(|e| CoachError::StorageReadFailure {
                reason: format!("could not parse {}: {}", index_path.display(), e),
            })?
        } else {
            debug!("No index at {}, starting empty", index_path.display());
            StoreIndex::default()
        };

        info!("Telemetry store opened at {}", storage_path.display());
        Ok(Self {
            storage_path,
            index,
        })
    }

    /// Open the store in the default application data directory.
    pub fn new_default() -> Result<Self, CoachError> {
        let storage_path = config::default_data_dir().ok_or(CoachError::NoConfigDir)?;
        Self::new(storage_path)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn lap_file(&self, lap_id: LapId) -> PathBuf {
        self.storage_path
            .join(LAPS_DIR_NAME)
            .join(format!("lap_{}.jsonl", lap_id))
    }

    fn analysis_file(&self, session_id: SessionId) -> PathBuf {
        self.storage_path
            .join(ANALYSES_DIR_NAME)
            .join(format!("session_{}.json", session_id))
    }

    fn persist_index(&self) -> Result<(), CoachError> {
        let content = serde_json::to_vec(&self.index).map_err(|e| {
            CoachError::StorageWriteFailure {
                reason: format!("could not serialize index: {}", e),
            }
        })?;
        write_atomically(&self.storage_path.join(INDEX_FILE_NAME), &content)
    }

    /// Apply a change to the index and persist it, rolling back the in-memory
    /// copy if the write fails.
    fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut StoreIndex) -> Result<T, CoachError>,
    ) -> Result<T, CoachError> {
        let snapshot = self.index.clone();
        let value = change(&mut self.index)?;
        if let Err(e) = self.persist_index() {
            warn!("Rolling back index change: {}", e);
            self.index = snapshot;
            return Err(e);
        }
        Ok(value)
    }
}

impl TelemetryStore for FileBasedStore {
    fn create_session(
        &mut self,
        track_id: &str,
        vehicle_id: &str,
        kind: SessionKind,
        start_time: SystemTime,
    ) -> Result<SessionId, CoachError> {
        self.mutate(|index| Ok(index.create_session(track_id, vehicle_id, kind, start_time)))
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
        self.mutate(|index| {
            index.create_lap(session_id, lap_number, lap_time, is_valid, max_speed, avg_speed)
        })
    }

    fn update_lap(&mut self, lap_id: LapId, update: &LapUpdate) -> Result<(), CoachError> {
        self.mutate(|index| index.update_lap(lap_id, update))
    }

    fn append_samples(&mut self, lap_id: LapId, samples: &[Sample]) -> Result<(), CoachError> {
        if !self.index.has_lap(lap_id) {
            return Err(CoachError::not_found("lap", lap_id.0));
        }
        let path = self.lap_file(lap_id);
        append_json_lines(&path, samples).map_err(|e| CoachError::StorageWriteFailure {
            reason: format!("could not append to {}: {}", path.display(), e),
        })
    }

    fn read_samples(&self, lap_id: LapId) -> Result<Vec<Sample>, CoachError> {
        if !self.index.has_lap(lap_id) {
            return Err(CoachError::not_found("lap", lap_id.0));
        }
        let path = self.lap_file(lap_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        json_lines::<Sample, _>(&path)
            .and_then(|lines| lines.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CoachError::StorageReadFailure {
                reason: format!("could not read {}: {}", path.display(), e),
            })
    }

    fn update_session(
        &mut self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<(), CoachError> {
        self.mutate(|index| index.update_session(session_id, update))
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
        self.mutate(|index| {
            index.upsert_records(lap_record, section_records);
            Ok(())
        })
    }

    fn save_analysis(
        &mut self,
        session_id: SessionId,
        analysis: &SessionAnalysis,
    ) -> Result<(), CoachError> {
        if !self.index.has_session(session_id) {
            return Err(CoachError::not_found("session", session_id.0));
        }
        let content = serde_json::to_vec(analysis).map_err(|e| {
            CoachError::StorageWriteFailure {
                reason: format!("could not serialize analysis of session {}: {}", session_id, e),
            }
        })?;
        write_atomically(&self.analysis_file(session_id), &content)
    }

    fn analysis(&self, session_id: SessionId) -> Result<Option<SessionAnalysis>, CoachError> {
        let path = self.analysis_file(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| CoachError::StorageReadFailure {
            reason: format!("could not read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CoachError::StorageReadFailure {
                reason: format!("could not parse {}: {}", path.display(), e),
            })
    }
}
