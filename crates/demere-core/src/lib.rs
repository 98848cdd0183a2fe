//! Trial simulation and run bookkeeping for the de Méré dice problem.
//!
//! - [`simulate`] runs one trial of a [`GameMode`] against an injected [`DieSource`].
//! - [`RunLedger`] records trials, persists them through a [`KeyValueStore`] and
//!   exports them as CSV.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod ledger;
mod store;

pub use ledger::{
    csv_quote, LedgerState, LedgerWarning, ModeSummary, RunEntry, RunLedger, EXPORT_FILENAME,
    STORAGE_KEY, TABLE_COLUMNS,
};
pub use store::{KeyValueStore, MemoryStore};

/// Number of faces on every die.
pub const FACES: u8 = 6;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DiceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("format error: {0}")]
    Format(String),
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Four rolls of one die; a roll wins on a six.
    #[default]
    OneDie,
    /// Twenty-four rolls of two dice; a roll wins on double six.
    TwoDice,
}

impl GameMode {
    pub const ALL: [Self; 2] = [Self::OneDie, Self::TwoDice];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneDie => "one_die",
            Self::TwoDice => "two_dice",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_die" => Some(Self::OneDie),
            "two_dice" => Some(Self::TwoDice),
            _ => None,
        }
    }

    #[must_use]
    pub fn roll_count(self) -> u32 {
        match self {
            Self::OneDie => 4,
            Self::TwoDice => 24,
        }
    }

    /// Closed-form probability that a trial has at least one winning roll.
    #[must_use]
    pub fn theoretical_probability(self) -> f64 {
        match self {
            Self::OneDie => 1.0 - (5.0_f64 / 6.0).powi(4),
            Self::TwoDice => 1.0 - (35.0_f64 / 36.0).powi(24),
        }
    }
}

impl Display for GameMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameMode {
    type Err = DiceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| DiceError::Validation(format!("unknown game mode: {value}")))
    }
}

/// One observation within a trial. `roll` is the 1-based position in the trial.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RollRecord {
    Single { roll: u32, value: u8 },
    Pair { roll: u32, d1: u8, d2: u8 },
}

impl RollRecord {
    #[must_use]
    pub fn roll(self) -> u32 {
        match self {
            Self::Single { roll, .. } | Self::Pair { roll, .. } => roll,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        match self {
            Self::Single { value, .. } => value == FACES,
            Self::Pair { d1, d2, .. } => d1 == FACES && d2 == FACES,
        }
    }

    fn faces_in_range(self) -> bool {
        let valid = |face: u8| (1..=FACES).contains(&face);
        match self {
            Self::Single { value, .. } => valid(value),
            Self::Pair { d1, d2, .. } => valid(d1) && valid(d2),
        }
    }
}

impl Display for RollRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single { roll, value } => write!(f, "#{roll}: {value}"),
            Self::Pair { roll, d1, d2 } => write!(f, "#{roll}: ({d1}, {d2})"),
        }
    }
}

/// Source of die faces. Implementations return a face in `1..=6`.
pub trait DieSource {
    fn roll_face(&mut self) -> u8;
}

impl<T: DieSource + ?Sized> DieSource for &mut T {
    fn roll_face(&mut self) -> u8 {
        (**self).roll_face()
    }
}

/// [`DieSource`] backed by a `rand` generator.
#[derive(Debug, Clone)]
pub struct RngDice<R> {
    rng: R,
}

impl<R: Rng> RngDice<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RngDice<SmallRng> {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::new(SmallRng::seed_from_u64(seed))
    }

    #[must_use]
    pub fn from_entropy() -> Self {
        Self::new(SmallRng::from_os_rng())
    }
}

impl<R: Rng> DieSource for RngDice<R> {
    fn roll_face(&mut self) -> u8 {
        self.rng.random_range(1..=FACES)
    }
}

/// Outcome of one trial. Success count and the occurred flag are always
/// derived from the roll sequence.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TrialResult {
    mode: GameMode,
    rolls: Vec<RollRecord>,
}

impl TrialResult {
    /// Rebuilds a trial from a recorded roll sequence.
    ///
    /// # Errors
    /// Returns [`DiceError::Validation`] when the sequence length, roll
    /// indices, record shape or face values do not fit `mode`.
    pub fn from_rolls(mode: GameMode, rolls: Vec<RollRecord>) -> Result<Self, DiceError> {
        if rolls.len() != mode.roll_count() as usize {
            return Err(DiceError::Validation(format!(
                "{mode} trial MUST have {} rolls, got {}",
                mode.roll_count(),
                rolls.len()
            )));
        }

        for (expected, record) in (1..).zip(&rolls) {
            if record.roll() != expected {
                return Err(DiceError::Validation(format!(
                    "roll index MUST be {expected}, got {}",
                    record.roll()
                )));
            }

            let shape_matches = matches!(
                (mode, record),
                (GameMode::OneDie, RollRecord::Single { .. })
                    | (GameMode::TwoDice, RollRecord::Pair { .. })
            );
            if !shape_matches {
                return Err(DiceError::Validation(format!(
                    "roll {expected} does not match {mode} record shape"
                )));
            }

            if !record.faces_in_range() {
                return Err(DiceError::Validation(format!(
                    "roll {expected} has a face outside 1..={FACES}"
                )));
            }
        }

        Ok(Self { mode, rolls })
    }

    /// Parses a roll sequence stored as JSON and rebuilds the trial.
    ///
    /// # Errors
    /// Returns [`DiceError::Format`] for undecodable JSON and
    /// [`DiceError::Validation`] when the decoded rolls do not fit `mode`.
    pub fn from_rolls_json(mode: GameMode, raw: &str) -> Result<Self, DiceError> {
        let rolls: Vec<RollRecord> = serde_json::from_str(raw)
            .map_err(|err| DiceError::Format(format!("invalid roll detail JSON: {err}")))?;
        Self::from_rolls(mode, rolls)
    }

    #[must_use]
    pub fn mode(&self) -> GameMode {
        self.mode
    }

    #[must_use]
    pub fn rolls(&self) -> &[RollRecord] {
        &self.rolls
    }

    #[must_use]
    pub fn roll_count(&self) -> u32 {
        self.mode.roll_count()
    }

    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.rolls
            .iter()
            .fold(0, |acc, record| acc + u32::from(record.is_success()))
    }

    #[must_use]
    pub fn occurred(&self) -> bool {
        self.success_count() > 0
    }

    #[must_use]
    pub fn theoretical_probability(&self) -> f64 {
        self.mode.theoretical_probability()
    }

    /// JSON encoding of the roll sequence, as stored in the run history.
    ///
    /// # Errors
    /// Returns [`DiceError::Format`] when the sequence cannot be encoded.
    pub fn rolls_json(&self) -> Result<String, DiceError> {
        serde_json::to_string(&self.rolls)
            .map_err(|err| DiceError::Format(format!("failed to encode roll sequence: {err}")))
    }

    #[must_use]
    pub fn report(&self) -> TrialReport {
        TrialReport {
            mode: self.mode,
            roll_count: self.roll_count(),
            success_count: self.success_count(),
            occurred: self.occurred(),
            theoretical_probability: self.theoretical_probability(),
            rolls: self.rolls.clone(),
        }
    }
}

/// Display view of a trial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialReport {
    pub mode: GameMode,
    pub roll_count: u32,
    pub success_count: u32,
    pub occurred: bool,
    pub theoretical_probability: f64,
    pub rolls: Vec<RollRecord>,
}

/// Runs one trial of `mode`, drawing every face from `source`.
pub fn simulate<D: DieSource + ?Sized>(mode: GameMode, source: &mut D) -> TrialResult {
    let rolls = (1..=mode.roll_count())
        .map(|roll| match mode {
            GameMode::OneDie => RollRecord::Single {
                roll,
                value: source.roll_face(),
            },
            GameMode::TwoDice => {
                let d1 = source.roll_face();
                let d2 = source.roll_face();
                RollRecord::Pair { roll, d1, d2 }
            }
        })
        .collect();

    TrialResult { mode, rolls }
}

/// Runs `count` trials of `mode` back to back.
pub fn simulate_many<D: DieSource + ?Sized>(
    mode: GameMode,
    count: usize,
    source: &mut D,
) -> Vec<TrialResult> {
    (0..count).map(|_| simulate(mode, source)).collect()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DiceError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DiceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DiceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DiceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DiceError::Format`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DiceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DiceError::Format(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Current UTC time at millisecond precision.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::now_utc())
}

/// Normalizes to UTC and drops sub-millisecond digits.
#[must_use]
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    let nanos = utc.nanosecond() / 1_000_000 * 1_000_000;
    utc.replace_nanosecond(nanos).unwrap_or(utc)
}
