//! Memory engine and builder for the mnemos memory engine

mod builder;
mod config;
mod engine;

pub use builder::EngineBuilder;
pub use config::{EngineConfig, SessionConfig};
pub use engine::MemoryEngine;

pub use mnemos_core::{Result, Turn, WorkingState};
pub use mnemos_memory::{ContextBlock, PreCompaction, StatsSnapshot};
