use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Candle timeframe supported by the kline endpoints.
///
/// String representations match the config file format (e.g. `"1m"`, `"1h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour8,
    Hour12,
    Day1,
}

impl TimeFrame {
    /// Parse a config-format string into a `TimeFrame`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Min1),
            "3m" => Some(Self::Min3),
            "5m" => Some(Self::Min5),
            "15m" => Some(Self::Min15),
            "30m" => Some(Self::Min30),
            "1h" => Some(Self::Hour1),
            "2h" => Some(Self::Hour2),
            "4h" => Some(Self::Hour4),
            "6h" => Some(Self::Hour6),
            "8h" => Some(Self::Hour8),
            "12h" => Some(Self::Hour12),
            "1d" => Some(Self::Day1),
            _ => None,
        }
    }

    /// Return the config-format string, which is also the Binance interval.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Hour6 => "6h",
            Self::Hour8 => "8h",
            Self::Hour12 => "12h",
            Self::Day1 => "1d",
        }
    }

    /// Length of one candle.
    pub fn duration(self) -> Duration {
        match self {
            Self::Min1 => Duration::minutes(1),
            Self::Min3 => Duration::minutes(3),
            Self::Min5 => Duration::minutes(5),
            Self::Min15 => Duration::minutes(15),
            Self::Min30 => Duration::minutes(30),
            Self::Hour1 => Duration::hours(1),
            Self::Hour2 => Duration::hours(2),
            Self::Hour4 => Duration::hours(4),
            Self::Hour6 => Duration::hours(6),
            Self::Hour8 => Duration::hours(8),
            Self::Hour12 => Duration::hours(12),
            Self::Day1 => Duration::days(1),
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// `false` while the candle is still being formed.
    pub closed: bool,
}

/// A single price reading for an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub instrument: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceObservation {
    pub fn new(instrument: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            price,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Buy,
    Sell,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A fired alert, handed to a notifier exactly once.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub id: Uuid,
    /// Name of the threshold rule or band signal that fired.
    pub rule: String,
    pub kind: AlertKind,
    pub observation: PriceObservation,
    /// The boundary or band level that was crossed.
    pub level: f64,
}

impl AlertEvent {
    pub fn new(
        rule: impl Into<String>,
        kind: AlertKind,
        observation: PriceObservation,
        level: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule: rule.into(),
            kind,
            observation,
            level,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.observation.instrument
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_every_binance_interval() {
        for s in [
            "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
        ] {
            let tf = TimeFrame::from_str(s).expect(s);
            assert_eq!(tf.as_str(), s);
        }
    }

    #[test]
    fn timeframe_invalid_string_returns_none() {
        assert_eq!(TimeFrame::from_str("2m"), None);
        assert_eq!(TimeFrame::from_str("1w"), None);
        assert_eq!(TimeFrame::from_str(""), None);
    }

    #[test]
    fn timeframe_duration_matches_interval() {
        assert_eq!(TimeFrame::Min15.duration(), Duration::minutes(15));
        assert_eq!(TimeFrame::Hour12.duration(), Duration::hours(12));
        assert_eq!(TimeFrame::Day1.duration(), Duration::hours(24));
    }

    #[test]
    fn alert_kind_display_is_uppercase() {
        assert_eq!(AlertKind::Buy.to_string(), "BUY");
        assert_eq!(AlertKind::Sell.to_string(), "SELL");
    }

    #[test]
    fn alert_kind_deserializes_from_lowercase() {
        let kind: AlertKind = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(kind, AlertKind::Sell);
    }

    #[test]
    fn alert_events_get_distinct_ids() {
        let obs = PriceObservation::new("BTCUSDT", 100.0, Utc::now());
        let a = AlertEvent::new("r", AlertKind::Buy, obs.clone(), 101.0);
        let b = AlertEvent::new("r", AlertKind::Buy, obs, 101.0);
        assert_ne!(a.id, b.id);
        assert_eq!(a.instrument(), "BTCUSDT");
    }
}
