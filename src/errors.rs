// Error types for lapcoach

use crate::telemetry::LiveEvent;
use snafu::Snafu;
use std::{io, sync::mpsc::SendError};

#[derive(Debug, Snafu)]
pub enum CoachError {
    // Errors from the sample source
    #[snafu(display("Sample source unavailable: {reason}"))]
    SourceUnavailable { reason: String },
    #[snafu(display("Sample source has no more samples"))]
    SourceExhausted,
    #[snafu(display("Malformed sample: {reason}"))]
    MalformedSample { reason: String },

    // Errors while broadcasting live events
    #[snafu(display("Error broadcasting live event"))]
    EventBroadcastError { source: Box<SendError<LiveEvent>> },

    // Telemetry store errors
    #[snafu(display("Storage write failed: {reason}"))]
    StorageWriteFailure { reason: String },
    #[snafu(display("Storage read failed: {reason}"))]
    StorageReadFailure { reason: String },
    #[snafu(display("{entity} {id} not found"))]
    NotFound { entity: String, id: u64 },

    // Analysis errors
    #[snafu(display("Analysis failed: {reason}"))]
    AnalysisFailure { reason: String },

    // Errors for the event writer
    #[snafu(display("Error writing event file"))]
    WriterError { source: io::Error },

    // Config management errors
    #[snafu(display("Could not find application data directory to save config file"))]
    NoConfigDir,
    #[snafu(display("Error writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },

    // User input validation errors
    #[snafu(display("Invalid user input: {field} - {reason}"))]
    InvalidUserInput { field: String, reason: String },
}

impl From<SendError<LiveEvent>> for CoachError {
    fn from(value: SendError<LiveEvent>) -> Self {
        CoachError::EventBroadcastError {
            source: Box::new(value),
        }
    }
}

impl CoachError {
    pub(crate) fn not_found(entity: &str, id: u64) -> Self {
        CoachError::NotFound {
            entity: entity.to_string(),
            id,
        }
    }
}
