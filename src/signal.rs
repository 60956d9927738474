use chrono::{DateTime, Utc};
use error_stack::{Report, bail};

use crate::config::BandConfig;
use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::bollinger::{BandBasis, BollingerBands};
use crate::model::{AlertEvent, AlertKind, PriceObservation};

/// Notional position used to de-duplicate band signals. No orders are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Flat,
    Long,
}

impl Position {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "flat" => Some(Self::Flat),
            "long" => Some(Self::Long),
            _ => None,
        }
    }
}

/// Bollinger band mean-reversion signal for one instrument.
///
/// Fires BUY when a closed candle finishes at or below the lower band while
/// flat, and SELL when it finishes at or above the upper band while long.
pub struct BandSignal {
    name: String,
    symbol: String,
    bands: BollingerBands,
    position: Position,
}

impl BandSignal {
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        bands: BollingerBands,
        initial_position: Position,
    ) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            bands,
            position: initial_position,
        }
    }

    /// Build a signal from a validated `[[bands]]` entry.
    pub fn from_config(config: &BandConfig) -> Result<Self, Report<IndicatorError>> {
        let Some(basis) = BandBasis::from_str(&config.basis) else {
            bail!(IndicatorError::InvalidParameter {
                name: format!("basis \"{}\"", config.basis),
            });
        };
        let Some(position) = Position::from_str(&config.initial_position) else {
            bail!(IndicatorError::InvalidParameter {
                name: format!("initial_position \"{}\"", config.initial_position),
            });
        };
        let bands = BollingerBands::new(basis, config.period, config.std_dev_multiplier)?;
        Ok(Self::new(
            config.name.clone(),
            config.symbol.clone(),
            bands,
            position,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn required_prices(&self) -> usize {
        self.bands.required_prices()
    }

    /// Evaluate the close series after a candle closed at `closed_at`.
    ///
    /// `closes` must end with the close of that candle.
    pub fn on_closed_candle(
        &mut self,
        closes: &[f64],
        closed_at: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>, Report<IndicatorError>> {
        let band = self.bands.latest(closes)?;
        let Some(&close) = closes.last() else {
            return Ok(None);
        };

        let fired = match self.position {
            Position::Flat if close <= band.lower => {
                self.position = Position::Long;
                Some((AlertKind::Buy, band.lower))
            }
            Position::Long if close >= band.upper => {
                self.position = Position::Flat;
                Some((AlertKind::Sell, band.upper))
            }
            _ => None,
        };

        tracing::debug!(
            signal = %self.name,
            indicator = self.bands.name(),
            close,
            upper = band.upper,
            middle = band.middle,
            lower = band.lower,
            "band signal evaluated"
        );

        Ok(fired.map(|(kind, level)| {
            let observation = PriceObservation::new(self.symbol.clone(), close, closed_at);
            AlertEvent::new(self.name.clone(), kind, observation, level)
        }))
    }
}
