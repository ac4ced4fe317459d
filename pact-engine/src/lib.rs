pub mod commands;
pub mod evaluator;
pub mod resolution;
pub mod scoring;
pub mod supervisor;

pub use commands::{CommandOutcome, CommandSurface};
pub use scoring::{ScoreBasis, ScoreEvent, ScoreOutcome, ScoringConfig, ScoringEngine};
pub use supervisor::{StartAllReport, StartOutcome, StartRefusal, StreamSupervisor};
