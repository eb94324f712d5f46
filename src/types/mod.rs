pub mod events;
pub mod ids;
pub mod options;
pub mod record;

pub use events::JobEvent;
pub use ids::{ClaimToken, JobId};
pub use options::{BackoffPolicy, JobOptions, JobOptionsPatch};
pub use record::{JobRecord, JobState, JobSummary, JobView, Progress};
