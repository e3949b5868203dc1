use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Market condition inferred from indicators. New regimes are added as variants
/// here and to `ALL`; the registry keeps one partition per entry of `ALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeKind {
    Bull,
    Bear,
    Sideways,
    Volatile,
    Inflationary,
}

impl RegimeKind {
    pub const COUNT: usize = 5;

    pub const ALL: [RegimeKind; Self::COUNT] = [
        RegimeKind::Bull,
        RegimeKind::Bear,
        RegimeKind::Sideways,
        RegimeKind::Volatile,
        RegimeKind::Inflationary,
    ];

    /// Position of this regime in `ALL`.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegimeKind::Bull => "bull",
            RegimeKind::Bear => "bear",
            RegimeKind::Sideways => "sideways",
            RegimeKind::Volatile => "volatile",
            RegimeKind::Inflationary => "inflationary",
        }
    }
}

impl std::fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegimeKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Config(format!("unknown regime '{s}'")))
    }
}

/// A classified regime with its confidence. Never mutated after construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabel {
    kind: RegimeKind,
    confidence: f64,
}

impl RegimeLabel {
    /// Confidence is clamped into [0, 1]; NaN becomes 0.
    pub fn new(kind: RegimeKind, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self { kind, confidence }
    }

    pub fn kind(&self) -> RegimeKind {
        self.kind
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

/// Indicator values a classification was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub close: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    /// Average true range as a fraction of `close`.
    pub atr_pct: f64,
    /// Year-over-year inflation, when a macro source is configured.
    pub inflation_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub timestamp: DateTime<Utc>,
    pub label: RegimeLabel,
    pub features: FeatureVector,
}

impl RegimeSnapshot {
    pub fn kind(&self) -> RegimeKind {
        self.label.kind()
    }
}

/// Emitted by the monitor when the authoritative regime changes.
/// `previous` is `None` for the first classification after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeChangeEvent {
    pub previous: Option<RegimeLabel>,
    pub current: RegimeLabel,
    pub snapshot: RegimeSnapshot,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_kind_parses_case_insensitively() {
        assert_eq!("Bull".parse::<RegimeKind>().unwrap(), RegimeKind::Bull);
        assert_eq!(" sideways ".parse::<RegimeKind>().unwrap(), RegimeKind::Sideways);
        assert!("crab".parse::<RegimeKind>().is_err());
    }

    #[test]
    fn label_confidence_is_clamped() {
        assert_eq!(RegimeLabel::new(RegimeKind::Bear, 1.7).confidence(), 1.0);
        assert_eq!(RegimeLabel::new(RegimeKind::Bear, -0.2).confidence(), 0.0);
        assert_eq!(RegimeLabel::new(RegimeKind::Bear, f64::NAN).confidence(), 0.0);
    }
}
