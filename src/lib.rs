pub mod core {
	pub mod config;
	pub mod error;
	pub mod protocol;
}

pub mod cli;
pub mod client;
pub mod engine;
pub mod game;
pub mod matchmaker;

// Re-export for convenience
pub use crate::engine::{EngineServer, SessionRegistry};
pub use crate::matchmaker::{Matchmaker, MatchmakerServer};
