pub mod engine;
pub mod puller;
pub mod rate_gate;
pub mod service;

pub use engine::{EngineEvent, EngineHandle, EngineOptions, EngineStatus, FreshenHandle, TickOutcome};
pub use puller::{FetchTarget, HistoryProgress, PullerSettings, SyncAlgorithm};
pub use rate_gate::SlidingWindowGate;
pub use service::{FeedService, RateGate};
