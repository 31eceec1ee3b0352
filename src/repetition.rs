//! Repetition rules.
//!
//! An appointment either happens once or repeats every N days, weeks,
//! months, or years. Rules serialize to a compact textual id (`"o"`,
//! `"d2"`, `"w1"`, ...) which is the only form the store sees; everything
//! above the store boundary works with the typed rule.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Granularity of a recurring rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatUnit {
    /// Every N days.
    Day,
    /// Every N weeks.
    Week,
    /// Every N months, same day-of-month.
    Month,
    /// Every N years, same calendar date.
    Year,
}

impl RepeatUnit {
    fn letter(self) -> char {
        match self {
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'm',
            Self::Year => 'y',
        }
    }
}

/// How often an appointment recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    /// No recurrence; the appointment fires once and is removed.
    Once,
    /// Recurs every `interval` units. `interval` is always >= 1; parsing
    /// rejects zero.
    Every {
        /// Recurrence granularity.
        unit: RepeatUnit,
        /// Number of units between occurrences.
        interval: u32,
    },
}

impl Repetition {
    /// Compact textual id: `"o"` for once, `{d|w|m|y}{interval}` otherwise.
    pub fn id(&self) -> String {
        match self {
            Self::Once => "o".to_owned(),
            Self::Every { unit, interval } => format!("{}{interval}", unit.letter()),
        }
    }

    /// Returns `true` for any rule other than [`Repetition::Once`].
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once)
    }
}

impl fmt::Display for Repetition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => write!(f, "once"),
            Self::Every { unit, interval } => {
                let noun = match unit {
                    RepeatUnit::Day => "day",
                    RepeatUnit::Week => "week",
                    RepeatUnit::Month => "month",
                    RepeatUnit::Year => "year",
                };
                if *interval == 1 {
                    write!(f, "every {noun}")
                } else {
                    write!(f, "every {interval} {noun}s")
                }
            }
        }
    }
}

/// Failure to parse a compact repetition id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepetitionParseError {
    /// The input was empty.
    #[error("empty repetition id")]
    Empty,

    /// The unit letter is not one of `o`, `d`, `w`, `m`, `y`.
    #[error("unknown repetition unit '{0}'")]
    UnknownUnit(char),

    /// A recurring unit letter with no interval digits after it.
    #[error("missing repetition interval")]
    MissingInterval,

    /// The interval is not a positive integer.
    #[error("invalid repetition interval '{0}'")]
    InvalidInterval(String),
}

impl FromStr for Repetition {
    type Err = RepetitionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let letter = chars.next().ok_or(RepetitionParseError::Empty)?;
        if letter == 'o' && chars.as_str().is_empty() {
            return Ok(Self::Once);
        }

        let unit = match letter {
            'd' => RepeatUnit::Day,
            'w' => RepeatUnit::Week,
            'm' => RepeatUnit::Month,
            'y' => RepeatUnit::Year,
            other => return Err(RepetitionParseError::UnknownUnit(other)),
        };

        let digits = chars.as_str();
        if digits.is_empty() {
            return Err(RepetitionParseError::MissingInterval);
        }
        let interval: u32 = digits
            .parse()
            .map_err(|_| RepetitionParseError::InvalidInterval(digits.to_owned()))?;
        if interval == 0 {
            return Err(RepetitionParseError::InvalidInterval(digits.to_owned()));
        }

        Ok(Self::Every { unit, interval })
    }
}

impl Serialize for Repetition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id())
    }
}

impl<'de> Deserialize<'de> for Repetition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
