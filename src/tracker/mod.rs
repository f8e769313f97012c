mod engine;
pub mod graph;
pub mod histogram;

pub use engine::Tracker;
pub use graph::{CommandStats, Graph, SessionCounters};
