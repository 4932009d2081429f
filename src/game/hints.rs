use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::protocol::HintView;

/// Trial division up to the square root
pub fn is_prime(n: u32) -> bool {
    if n <= 1 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

pub fn digit_sum(mut n: u32) -> u32 {
    let mut sum = 0;
    while n > 0 {
        sum += n % 10;
        n /= 10;
    }
    sum
}

/// Every fact about a target, before any are hidden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintFacts {
    pub is_even: bool,
    pub digit_sum: u32,
    pub is_prime: bool,
}

impl HintFacts {
    pub fn of(target: u32) -> Self {
        Self {
            is_even: target % 2 == 0,
            digit_sum: digit_sum(target),
            is_prime: is_prime(target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
    Parity,
    DigitSum,
    Primality,
}

impl HintKind {
    pub const ALL: [HintKind; 3] = [HintKind::Parity, HintKind::DigitSum, HintKind::Primality];
}

/// Which facts are shown. Always one or two of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HintSelection {
    parity: bool,
    digit_sum: bool,
    primality: bool,
}

impl HintSelection {
    /// Shuffle the three kinds and keep the first one or two, with even odds.
    pub fn choose<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut order = HintKind::ALL;
        order.shuffle(rng);
        let count = 1 + usize::from(rng.random_bool(0.5));
        Self::only(&order[..count])
    }

    pub fn only(kinds: &[HintKind]) -> Self {
        let mut selection = Self::default();
        for kind in kinds {
            match kind {
                HintKind::Parity => selection.parity = true,
                HintKind::DigitSum => selection.digit_sum = true,
                HintKind::Primality => selection.primality = true,
            }
        }
        selection
    }

    pub fn reveals(&self, kind: HintKind) -> bool {
        match kind {
            HintKind::Parity => self.parity,
            HintKind::DigitSum => self.digit_sum,
            HintKind::Primality => self.primality,
        }
    }

    pub fn count(&self) -> usize {
        HintKind::ALL.iter().filter(|kind| self.reveals(**kind)).count()
    }

    pub fn disclose(&self, facts: &HintFacts) -> HintView {
        HintView {
            is_even: self.parity.then_some(facts.is_even),
            digit_sum: self.digit_sum.then_some(facts.digit_sum),
            is_prime: self.primality.then_some(facts.is_prime),
        }
    }
}

/// Compute the facts for `target` and pick the subset both players will see
pub fn generate<R: Rng + ?Sized>(target: u32, rng: &mut R) -> HintView {
    HintSelection::choose(rng).disclose(&HintFacts::of(target))
}
