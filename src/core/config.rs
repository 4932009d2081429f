/// Runtime configuration for the engine and the matchmaker, with the defaults
/// the game is balanced around.
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::error::ConfigError;

/// Inclusive bounds the secret number is drawn from
pub const MIN_NUMBER: u32 = 1;
pub const MAX_NUMBER: u32 = 100;

pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    /// Base URL clients use to reach this engine, e.g. `ws://games.example.com:8081`.
    /// Derived from the bound address when not set.
    pub public_url: Option<String>,
    pub turn_timeout: Duration,
    /// How long a session slot may sit with fewer than two players
    pub join_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
            public_url: None,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Resolve the advertised base URL against the address actually bound
    pub fn base_url(&self, bound: SocketAddr) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("ws://{bound}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    pub bind: SocketAddr,
    pub match_timeout: Duration,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            match_timeout: DEFAULT_MATCH_TIMEOUT,
        }
    }
}

/// Which allocator resource a session is created on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetTarget {
    Fleet(String),
    Alias(String),
}

impl FleetTarget {
    pub fn from_ids(fleet_id: Option<String>, alias_id: Option<String>) -> Result<Self, ConfigError> {
        let fleet_id = fleet_id.filter(|id| !id.is_empty());
        let alias_id = alias_id.filter(|id| !id.is_empty());
        match (fleet_id, alias_id) {
            (Some(fleet), None) => Ok(FleetTarget::Fleet(fleet)),
            (None, Some(alias)) => Ok(FleetTarget::Alias(alias)),
            _ => Err(ConfigError::FleetTarget),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Endpoint that creates a game session and answers with its address
    pub endpoint: String,
    pub target: FleetTarget,
    pub location: String,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerConfig {
    /// Always hand out the same engine URL
    Static { location: String },
    /// Ask an external allocator for a fresh engine per match
    Allocator(AllocatorConfig),
}
