//! Outcome computation
//!
//! Two separate phases:
//! 1. [`nominal_outcome`] turns 32 bytes of entropy and a win probability
//!    into a loss or a payout tier. Pure.
//! 2. [`apply_guard`] checks a nominal win against the profit guard and
//!    downgrades it to the highest lower tier that fits, or to a loss.

use crate::amount::Amount;
use crate::config::OddsConfig;
use crate::errors::LedgerResult;
use crate::games::types::{FairnessProof, GameKind, GuardDecision};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Mutex;

pub const BPS_ONE: u32 = 10_000;

/// Highest crash point a round can draw.
pub const MAX_CRASH_POINT_BPS: u32 = 1_000_000;

/// Entropy for one round plus its proof, if the source produces one
#[derive(Debug, Clone)]
pub struct Entropy {
    pub bytes: [u8; 32],
    pub proof: Option<FairnessProof>,
}

impl Entropy {
    /// Uniform value in [0, 1) from the given 8-byte lane (0..4).
    pub fn unit(&self, lane: usize) -> f64 {
        let start = (lane % 4) * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[start..start + 8]);
        // 53 bits keep the value exactly representable.
        (u64::from_be_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn lane_u64(&self, lane: usize) -> u64 {
        let start = (lane % 4) * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[start..start + 8]);
        u64::from_be_bytes(buf)
    }
}

/// Source of per-round randomness
pub trait OutcomeSource: Send + Sync {
    fn draw(&self, round_id: &str, game: GameKind, user_id: &str) -> LedgerResult<Entropy>;
}

/// Always returns the same bytes. Used for simulations and replay.
pub struct FixedOutcomeSource {
    bytes: [u8; 32],
}

impl FixedOutcomeSource {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Entropy that wins at any positive probability and picks the top tier.
    pub fn always_win() -> Self {
        Self::new([0u8; 32])
    }

    pub fn always_lose() -> Self {
        Self::new([0xff; 32])
    }
}

impl OutcomeSource for FixedOutcomeSource {
    fn draw(&self, _round_id: &str, _game: GameKind, _user_id: &str) -> LedgerResult<Entropy> {
        Ok(Entropy {
            bytes: self.bytes,
            proof: None,
        })
    }
}

/// Reproducible pseudo-random source
pub struct SeededOutcomeSource {
    rng: Mutex<StdRng>,
}

impl SeededOutcomeSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl OutcomeSource for SeededOutcomeSource {
    fn draw(&self, _round_id: &str, _game: GameKind, _user_id: &str) -> LedgerResult<Entropy> {
        let mut bytes = [0u8; 32];
        match self.rng.lock() {
            Ok(mut rng) => rng.fill_bytes(&mut bytes),
            Err(poisoned) => poisoned.into_inner().fill_bytes(&mut bytes),
        }
        Ok(Entropy { bytes, proof: None })
    }
}

/// Base probability, plus the loyalty boost for active players, capped.
pub fn win_probability(odds: &OddsConfig, rounds_in_window: u64) -> f64 {
    let mut p = odds.base_win_probability;
    if rounds_in_window >= odds.loyalty_min_rounds {
        p += odds.loyalty_boost;
    }
    p.min(odds.max_win_probability).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nominal {
    Loss,
    /// Index into the game's payout tiers.
    Win(usize),
}

/// Draw a loss or a tier. Lower multipliers are proportionally more likely.
pub fn nominal_outcome(win_probability: f64, entropy: &Entropy, tiers: &[u32]) -> Nominal {
    if tiers.is_empty() || entropy.unit(0) >= win_probability {
        return Nominal::Loss;
    }

    let weights: Vec<u64> = tiers.iter().map(|&bps| 1_000_000_000 / bps.max(1) as u64).collect();
    let total: u64 = weights.iter().sum();
    let mut pick = entropy.lane_u64(1) % total.max(1);
    for (index, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return Nominal::Win(index);
        }
        pick -= weight;
    }
    Nominal::Win(tiers.len() - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedOutcome {
    pub payout: Amount,
    pub multiplier_bps: Option<u32>,
    pub decision: GuardDecision,
}

impl GuardedOutcome {
    pub fn loss(decision: GuardDecision) -> Self {
        Self {
            payout: Amount::ZERO,
            multiplier_bps: None,
            decision,
        }
    }
}

/// Deterministically gate a nominal win through `is_safe`.
pub fn apply_guard<F>(nominal: Nominal, bet: Amount, tiers: &[u32], is_safe: F) -> GuardedOutcome
where
    F: Fn(Amount) -> bool,
{
    let Nominal::Win(drawn) = nominal else {
        return GuardedOutcome::loss(GuardDecision::Loss);
    };

    for (index, &bps) in tiers.iter().enumerate().skip(drawn) {
        let payout = bet.mul_bps(bps);
        if is_safe(payout) {
            return GuardedOutcome {
                payout,
                multiplier_bps: Some(bps),
                decision: if index == drawn {
                    GuardDecision::Paid
                } else {
                    GuardDecision::Downgraded
                },
            };
        }
    }

    GuardedOutcome::loss(GuardDecision::ForcedLoss)
}

/// Crash point for a new round. A nominal loss busts at 1.00x; a nominal
/// win draws from a heavy-tailed distribution starting at 1.01x.
pub fn crash_point(win_probability: f64, entropy: &Entropy) -> u32 {
    if entropy.unit(0) >= win_probability {
        return BPS_ONE;
    }
    let r = entropy.unit(2);
    let point = 10_100.0 / (1.0 - r * 0.99);
    (point as u32).clamp(10_100, MAX_CRASH_POINT_BPS)
}

/// Validate and convert a player-chosen multiplier.
pub fn multiplier_to_bps(multiplier: f64) -> Option<u32> {
    if !multiplier.is_finite() {
        return None;
    }
    let bps = (multiplier * BPS_ONE as f64).round();
    if bps <= BPS_ONE as f64 || bps > MAX_CRASH_POINT_BPS as f64 {
        return None;
    }
    Some(bps as u32)
}
