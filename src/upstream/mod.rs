pub mod backoff;
pub mod client;
pub mod isolation;
pub mod manager;
pub mod oauth;
pub mod state;

pub use client::{CallOutcome, UpstreamClient, UpstreamSink};
pub use manager::{ServerView, UpstreamManager};
pub use state::{FailureClass, HealthLevel, Phase, UpstreamState};
