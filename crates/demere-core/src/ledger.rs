use std::borrow::Cow;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    format_rfc3339, now_utc, truncate_to_millis, DiceError, GameMode, KeyValueStore, TrialResult,
};

/// Key the run history is stored under.
pub const STORAGE_KEY: &str = "demere_runs_v1";

/// File name offered for CSV exports.
pub const EXPORT_FILENAME: &str = "demere_results.csv";

pub const TABLE_COLUMNS: [&str; 7] = [
    "trial_id",
    "game",
    "timestamp",
    "n_lanzamientos",
    "exitos",
    "ocurrio",
    "detalles_json",
];

/// One recorded trial. Field names on the wire follow the stored history
/// format shared with the CSV export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEntry {
    trial_id: u32,
    game: GameMode,
    #[serde(with = "rfc3339_utc")]
    timestamp: OffsetDateTime,
    #[serde(rename = "n_lanzamientos")]
    roll_count: u32,
    #[serde(rename = "exitos")]
    success_count: u32,
    #[serde(rename = "ocurrio", with = "occurred_flag")]
    occurred: bool,
    #[serde(rename = "detalles_json")]
    roll_detail: String,
}

impl RunEntry {
    #[must_use]
    pub fn trial_id(&self) -> u32 {
        self.trial_id
    }

    #[must_use]
    pub fn game(&self) -> GameMode {
        self.game
    }

    #[must_use]
    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    #[must_use]
    pub fn roll_count(&self) -> u32 {
        self.roll_count
    }

    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    #[must_use]
    pub fn occurred(&self) -> bool {
        self.occurred
    }

    /// Serialized roll sequence. The ledger never interprets it.
    #[must_use]
    pub fn roll_detail(&self) -> &str {
        &self.roll_detail
    }

    fn check_consistency(&self, expected_id: u32) -> Result<(), DiceError> {
        if self.trial_id != expected_id {
            return Err(DiceError::Validation(format!(
                "trial_id MUST be {expected_id}, got {}",
                self.trial_id
            )));
        }

        if self.roll_count != self.game.roll_count() {
            return Err(DiceError::Validation(format!(
                "trial {} has n_lanzamientos {} but {} uses {}",
                self.trial_id,
                self.roll_count,
                self.game,
                self.game.roll_count()
            )));
        }

        if self.success_count > self.roll_count {
            return Err(DiceError::Validation(format!(
                "trial {} has more successes than rolls",
                self.trial_id
            )));
        }

        if self.occurred != (self.success_count > 0) {
            return Err(DiceError::Validation(format!(
                "trial {} ocurrio disagrees with exitos",
                self.trial_id
            )));
        }

        Ok(())
    }
}

/// Recoverable problem met while reading or writing the run history.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LedgerWarning {
    NothingStored { key: String },
    LoadFailed(String),
    PersistFailed(String),
    ClearFailed(String),
}

impl LedgerWarning {
    /// True when persistence degraded, as opposed to a first run with no history.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::NothingStored { .. })
    }
}

impl Display for LedgerWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NothingStored { key } => write!(f, "no run history stored under {key}"),
            Self::LoadFailed(reason) => {
                write!(f, "run history could not be loaded, starting empty: {reason}")
            }
            Self::PersistFailed(reason) => {
                write!(f, "run history kept in memory only: {reason}")
            }
            Self::ClearFailed(reason) => {
                write!(f, "stored run history may not be fully cleared: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LedgerState {
    Empty,
    Populated,
}

/// Empirical vs theoretical comparison for one game mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeSummary {
    pub mode: GameMode,
    pub trials: u32,
    pub occurred: u32,
    pub empirical_rate: Option<f64>,
    pub theoretical_probability: f64,
}

/// Append-ordered run history backed by a [`KeyValueStore`].
///
/// Every mutation rewrites the stored history. Storage failures never undo an
/// in-memory change; they are collected as [`LedgerWarning`]s.
#[derive(Debug)]
pub struct RunLedger<S> {
    store: S,
    key: String,
    entries: Vec<RunEntry>,
    warnings: Vec<LedgerWarning>,
}

impl<S: KeyValueStore> RunLedger<S> {
    pub fn new(store: S) -> Self {
        Self::with_key(store, STORAGE_KEY)
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            entries: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Replaces the in-memory history with the stored one. Absent, unreadable
    /// or inconsistent data leaves the ledger empty. Returns the number of
    /// restored entries.
    pub fn load(&mut self) -> usize {
        self.entries.clear();

        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.record(LedgerWarning::NothingStored {
                    key: self.key.clone(),
                });
                return 0;
            }
            Err(err) => {
                self.record(LedgerWarning::LoadFailed(err.to_string()));
                return 0;
            }
        };

        match decode_entries(&raw) {
            Ok(entries) => {
                self.entries = entries;
                tracing::debug!(key = %self.key, entries = self.entries.len(), "run history loaded");
            }
            Err(err) => self.record(LedgerWarning::LoadFailed(err.to_string())),
        }

        self.entries.len()
    }

    /// Records `result` with the current time.
    ///
    /// # Errors
    /// Returns [`DiceError::Format`] when the roll sequence cannot be encoded.
    /// Storage failures are not errors; see [`RunLedger::take_warnings`].
    pub fn append(&mut self, result: &TrialResult) -> Result<RunEntry, DiceError> {
        self.append_at(result, now_utc())
    }

    /// Records `result` captured at `timestamp`, kept at millisecond precision.
    ///
    /// # Errors
    /// Returns [`DiceError::Format`] when the roll sequence cannot be encoded.
    pub fn append_at(
        &mut self,
        result: &TrialResult,
        timestamp: OffsetDateTime,
    ) -> Result<RunEntry, DiceError> {
        let entry = RunEntry {
            trial_id: self.next_trial_id(),
            game: result.mode(),
            timestamp: truncate_to_millis(timestamp),
            roll_count: result.roll_count(),
            success_count: result.success_count(),
            occurred: result.occurred(),
            roll_detail: result.rolls_json()?,
        };

        self.entries.push(entry.clone());
        tracing::debug!(
            key = %self.key,
            trial_id = entry.trial_id,
            game = %entry.game,
            exitos = entry.success_count,
            "trial recorded"
        );
        self.persist();
        Ok(entry)
    }

    /// Drops every entry and wipes the stored history.
    pub fn clear(&mut self) {
        let dropped = self.entries.len();
        self.entries.clear();

        if let Err(err) = self.store.set(&self.key, "[]") {
            self.record(LedgerWarning::ClearFailed(err.to_string()));
        }
        if let Err(err) = self.store.remove(&self.key) {
            self.record(LedgerWarning::ClearFailed(err.to_string()));
        }

        tracing::debug!(key = %self.key, dropped, "run history cleared");
    }

    /// Renders the history as CSV: a header row then one row per entry in
    /// append order, rows joined by `\n`.
    ///
    /// # Errors
    /// Returns [`DiceError::Format`] when a timestamp cannot be rendered.
    pub fn to_table(&self) -> Result<String, DiceError> {
        let mut lines = Vec::with_capacity(self.entries.len() + 1);
        lines.push(TABLE_COLUMNS.join(","));

        for entry in &self.entries {
            let timestamp = format_rfc3339(entry.timestamp)?;
            let row = [
                Cow::Owned(entry.trial_id.to_string()),
                csv_field(entry.game.as_str()),
                csv_field(&timestamp),
                Cow::Owned(entry.roll_count.to_string()),
                Cow::Owned(entry.success_count.to_string()),
                Cow::Borrowed(if entry.occurred { "1" } else { "0" }),
                Cow::Owned(csv_quote(&entry.roll_detail)),
            ];
            lines.push(row.join(","));
        }

        Ok(lines.join("\n"))
    }

    #[must_use]
    pub fn summary(&self) -> Vec<ModeSummary> {
        GameMode::ALL
            .into_iter()
            .map(|mode| {
                let (trials, occurred) = self
                    .entries
                    .iter()
                    .filter(|entry| entry.game == mode)
                    .fold((0_u32, 0_u32), |(trials, occurred), entry| {
                        (trials + 1, occurred + u32::from(entry.occurred))
                    });

                ModeSummary {
                    mode,
                    trials,
                    occurred,
                    empirical_rate: (trials > 0)
                        .then(|| f64::from(occurred) / f64::from(trials)),
                    theoretical_probability: mode.theoretical_probability(),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn entries(&self) -> &[RunEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn state(&self) -> LedgerState {
        if self.entries.is_empty() {
            LedgerState::Empty
        } else {
            LedgerState::Populated
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns and forgets the warnings collected so far.
    pub fn take_warnings(&mut self) -> Vec<LedgerWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn next_trial_id(&self) -> u32 {
        self.entries
            .last()
            .map_or(1, |entry| entry.trial_id.saturating_add(1))
    }

    fn persist(&mut self) {
        let payload = match serde_json::to_string(&self.entries) {
            Ok(payload) => payload,
            Err(err) => {
                self.record(LedgerWarning::PersistFailed(format!(
                    "failed to serialize run history: {err}"
                )));
                return;
            }
        };

        if let Err(err) = self.store.set(&self.key, &payload) {
            self.record(LedgerWarning::PersistFailed(err.to_string()));
        }
    }

    fn record(&mut self, warning: LedgerWarning) {
        tracing::debug!(key = %self.key, degraded = warning.is_degraded(), "{warning}");
        self.warnings.push(warning);
    }
}

fn decode_entries(raw: &str) -> Result<Vec<RunEntry>, DiceError> {
    let entries: Vec<RunEntry> = serde_json::from_str(raw)
        .map_err(|err| DiceError::Format(format!("invalid stored run history: {err}")))?;

    for (expected_id, entry) in (1..).zip(&entries) {
        entry.check_consistency(expected_id)?;
    }

    Ok(entries)
}

/// Wraps `field` in double quotes, doubling any quote inside it.
#[must_use]
pub fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(csv_quote(field))
    } else {
        Cow::Borrowed(field)
    }
}

mod rfc3339_utc {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    use crate::{format_rfc3339, parse_rfc3339_utc};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let formatted =
            format_rfc3339(*value).map_err(<S::Error as serde::ser::Error>::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }
}

/// `ocurrio` is stored as a 0/1 integer.
mod occurred_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(serde::de::Error::custom(format!(
                "ocurrio MUST be 0 or 1, got {other}"
            ))),
        }
    }
}
