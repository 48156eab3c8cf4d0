// Library interface for lapcoach
// The binary and the integration tests drive the tracker through it

pub mod analysis;
pub mod config;
pub mod errors;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod writer;

// Re-export commonly used types
pub use analysis::{AnalysisOutcome, LapAnalysis, SessionAnalysis};
pub use config::CoachConfig;
pub use errors::CoachError;
pub use session::{LapSessionTracker, TrackerState};
pub use store::{FileBasedStore, InMemoryStore, TelemetryStore};
pub use telemetry::{LiveEvent, Sample, SourceSnapshot};
