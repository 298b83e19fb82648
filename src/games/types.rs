use crate::amount::Amount;
use crate::errors::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported instant games
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Slots,
    Dice,
    CoinFlip,
    Crash,
}

impl GameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::Slots => "slots",
            GameKind::Dice => "dice",
            GameKind::CoinFlip => "coinflip",
            GameKind::Crash => "crash",
        }
    }

    /// Payout multipliers in basis points, highest first. Crash has no fixed
    /// tiers; the player picks the multiplier at cash-out.
    pub fn payout_tiers(&self) -> &'static [u32] {
        match self {
            GameKind::Slots => &[100_000, 50_000, 30_000, 20_000, 15_000],
            GameKind::Dice => &[20_000, 15_000],
            GameKind::CoinFlip => &[19_500],
            GameKind::Crash => &[],
        }
    }
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slots" | "slot" => Ok(GameKind::Slots),
            "dice" => Ok(GameKind::Dice),
            "coinflip" | "coin_flip" => Ok(GameKind::CoinFlip),
            "crash" => Ok(GameKind::Crash),
            other => Err(LedgerError::invalid(format!("unknown game '{}'", other))),
        }
    }
}

/// What the profit guard did to a nominal outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    /// Nominal loss, nothing to check.
    Loss,
    Paid,
    /// Paid at a lower tier than drawn.
    Downgraded,
    /// Nominal win, no tier fit the pool.
    ForcedLoss,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    /// Crash round waiting for a cash-out.
    Open,
    Settled,
}

/// Proof that an outcome came from the published VRF key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FairnessProof {
    /// Hex VRF pre-output; outcome bytes are derived from it on verification.
    pub vrf_output: String,
    pub vrf_proof: String,
    pub public_key: String,
    pub input_message: String,
}

/// Persisted per-round record, also the idempotency marker for the round id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundRecord {
    pub round_id: String,
    pub user_id: String,
    pub game: GameKind,
    pub bet: Amount,
    pub payout: Amount,
    /// Unset while a crash round is still open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<GuardDecision>,
    pub status: RoundStatus,
    /// Multiplier actually paid, in basis points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier_bps: Option<u32>,
    /// Crash rounds only, revealed once the round settles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_point_bps: Option<u32>,
    pub win_probability: f64,
    /// Whether the payout went to the locked balance.
    #[serde(default)]
    pub locked: bool,
    /// Withheld while a crash round is open; the output fixes the crash point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<FairnessProof>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
}

impl RoundRecord {
    pub fn is_win(&self) -> bool {
        self.payout.is_positive()
    }
}

/// Crash point and proof of an open crash round. Stored apart from the
/// round record and folded into it at cash-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedCrash {
    pub crash_point_bps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<FairnessProof>,
}

/// Returned to callers of settle / cash-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub round: RoundRecord,
    /// `game` balance after the round.
    pub game_balance: Amount,
    pub game_locked_balance: Amount,
    /// Set when this round completed a wagering requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<Amount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_descend() {
        for game in [GameKind::Slots, GameKind::Dice, GameKind::CoinFlip] {
            let tiers = game.payout_tiers();
            assert!(tiers.windows(2).all(|w| w[0] > w[1]), "{}", game);
        }
        assert!(GameKind::Crash.payout_tiers().is_empty());
    }

    #[test]
    fn test_parse_game() {
        assert_eq!("CoinFlip".parse::<GameKind>().unwrap(), GameKind::CoinFlip);
        assert_eq!("slots".parse::<GameKind>().unwrap(), GameKind::Slots);
        assert!("roulette".parse::<GameKind>().is_err());
    }

    #[test]
    fn test_game_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&GameKind::CoinFlip).unwrap(), "\"coinflip\"");
    }
}
