/// The turn state machine of a guessing duel, free of any IO.
///
/// A `Duel` only answers "what happens if...". Locking, timers and message
/// delivery live in [`crate::game::session`].
use rand::Rng;

use crate::core::config::{MAX_NUMBER, MIN_NUMBER};
use crate::core::protocol::{EndReason, HintView};
use crate::game::hints;

pub const PLAYERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finish {
    pub winner: usize,
    pub reason: EndReason,
}

impl Finish {
    pub fn loser(&self) -> usize {
        1 - self.winner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Finished,
    NotYourTurn,
    OutOfRange { min: u32, max: u32 },
}

impl Rejection {
    pub fn message(&self) -> String {
        match self {
            Rejection::Finished => "Game is over".to_string(),
            Rejection::NotYourTurn => "Not your turn".to_string(),
            Rejection::OutOfRange { min, max } => {
                format!("Number out of valid range ({min}-{max})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessResult {
    Rejected(Rejection),
    /// Wrong number: the range shrank and `current` now holds the turn
    Narrowed { min: u32, max: u32, current: usize },
    Won(Finish),
}

#[derive(Debug, Clone)]
pub struct Duel {
    target: u32,
    min: u32,
    max: u32,
    current: usize,
    /// Bumped on every accepted guess; timers compare against it to detect staleness
    turn: u64,
    hints: HintView,
    finish: Option<Finish>,
}

impl Duel {
    /// Draw the target, the hints and the opening player
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let target = rng.random_range(MIN_NUMBER..=MAX_NUMBER);
        let hints = hints::generate(target, rng);
        let first = rng.random_range(0..PLAYERS);
        Self::with_target(target, first, hints)
    }

    pub fn with_target(target: u32, first: usize, hints: HintView) -> Self {
        debug_assert!((MIN_NUMBER..=MAX_NUMBER).contains(&target));
        debug_assert!(first < PLAYERS);
        Self {
            target,
            min: MIN_NUMBER,
            max: MAX_NUMBER,
            current: first,
            turn: 0,
            hints,
            finish: None,
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn range(&self) -> (u32, u32) {
        (self.min, self.max)
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn hints(&self) -> HintView {
        self.hints
    }

    pub fn finish(&self) -> Option<Finish> {
        self.finish
    }

    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    pub fn guess(&mut self, player: usize, value: i64) -> GuessResult {
        if self.finish.is_some() {
            return GuessResult::Rejected(Rejection::Finished);
        }
        if player != self.current {
            return GuessResult::Rejected(Rejection::NotYourTurn);
        }
        if value < i64::from(self.min) || value > i64::from(self.max) {
            return GuessResult::Rejected(Rejection::OutOfRange {
                min: self.min,
                max: self.max,
            });
        }

        // In range, so it fits
        let value = value as u32;
        self.turn += 1;
        if value == self.target {
            return GuessResult::Won(self.conclude(player, EndReason::Guessed));
        }

        if value < self.target {
            self.min = value + 1;
        } else {
            self.max = value - 1;
        }
        self.current = 1 - self.current;
        GuessResult::Narrowed {
            min: self.min,
            max: self.max,
            current: self.current,
        }
    }

    /// The deadline armed for `turn` passed. Only acts if that turn is still the live one.
    pub fn expire_turn(&mut self, turn: u64) -> Option<Finish> {
        if self.finish.is_some() || turn != self.turn {
            return None;
        }
        Some(self.conclude(1 - self.current, EndReason::Timeout))
    }

    pub fn disconnect(&mut self, player: usize) -> Option<Finish> {
        if self.finish.is_some() {
            return None;
        }
        Some(self.conclude(1 - player, EndReason::Disconnect))
    }

    fn conclude(&mut self, winner: usize, reason: EndReason) -> Finish {
        let finish = Finish { winner, reason };
        self.finish = Some(finish);
        finish
    }
}
