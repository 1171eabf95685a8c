pub mod control;
pub mod convergence;
pub mod improver;
pub mod judge;
pub mod pipeline;
pub mod registry;
pub mod summarizer;
pub mod tester;

pub use control::{FeedbackOutcome, Phase, RunControl};
pub use registry::RunRegistry;
