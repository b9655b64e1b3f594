pub mod dispatcher;
pub mod jobs;

pub use dispatcher::{ChannelOutcome, DispatchSummary, Dispatcher, SkipReason};
pub use jobs::{handle_job, DispatchClaims, DispatchJob};
