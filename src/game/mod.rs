pub mod duel;
pub mod hints;
pub mod session;

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

pub use duel::{Duel, Finish, GuessResult, Rejection};
pub use session::{Entrant, GameSession, Outbound, PlayerLink, Seat, SessionReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
