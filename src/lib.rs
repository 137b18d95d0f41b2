pub mod core;

pub use crate::core::caption::{CaptionEngine, CaptionEngineOptions, CaptionError, CaptionOutcome};
pub use crate::core::model::{CaptionDetail, CaptionStatus, JobSummary, Settings};
pub use crate::core::pipeline::{caption_single, run_job, StartJobInput};
