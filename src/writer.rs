use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::Path,
    sync::mpsc::Receiver,
};

use log::{debug, error};

use crate::{CoachError, telemetry::LiveEvent};

/// Append every received event to `file` as one JSON line until the sending
/// side hangs up.
pub fn write_events(file: &Path, event_receiver: Receiver<LiveEvent>) -> Result<(), CoachError> {
    let event_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .map_err(|e| CoachError::WriterError { source: e })?;
    let mut event_file_writer = BufWriter::new(event_file);
    let mut written = 0usize;
    for event in &event_receiver {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("Could not serialize event: {}", e);
                continue;
            }
        };
        writeln!(event_file_writer, "{}", line)
            .map_err(|e| CoachError::WriterError { source: e })?;
        written += 1;
    }
    event_file_writer
        .flush()
        .map_err(|e| CoachError::WriterError { source: e })?;
    debug!("Wrote {} events to {}", written, file.display());
    Ok(())
}
