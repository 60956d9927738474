use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::ma::{Ema, Sma};

/// Moving average used as the middle band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandBasis {
    Sma,
    Ema,
}

impl BandBasis {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sma" => Some(Self::Sma),
            "ema" => Some(Self::Ema),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Bollinger bands: a moving-average middle line plus/minus a multiple of
/// the sample standard deviation over the same window.
pub struct BollingerBands {
    basis: Box<dyn Indicator>,
    period: usize,
    std_dev_multiplier: f64,
}

impl BollingerBands {
    pub fn new(
        basis: BandBasis,
        period: usize,
        std_dev_multiplier: f64,
    ) -> Result<Self, Report<IndicatorError>> {
        if period < 2 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be >= 2".into(),
            });
        }
        if !std_dev_multiplier.is_finite() || std_dev_multiplier <= 0.0 {
            bail!(IndicatorError::InvalidParameter {
                name: "std_dev_multiplier must be > 0".into(),
            });
        }
        let basis: Box<dyn Indicator> = match basis {
            BandBasis::Sma => Box::new(Sma::new(period)?),
            BandBasis::Ema => Box::new(Ema::new(period)?),
        };
        Ok(Self {
            basis,
            period,
            std_dev_multiplier,
        })
    }

    /// Band values for every full window, oldest first.
    pub fn calculate_bands(&self, prices: &[f64]) -> Result<Vec<Band>, Report<IndicatorError>> {
        if prices.len() < self.period {
            bail!(IndicatorError::InsufficientData {
                required: self.period,
                available: prices.len(),
            });
        }

        let middles = self.basis.calculate(prices)?;
        let n = self.period as f64;

        let bands = prices
            .windows(self.period)
            .zip(middles.iter())
            .map(|(window, &middle)| {
                let mean = window.iter().sum::<f64>() / n;
                let variance = window.iter().map(|&p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
                let width = self.std_dev_multiplier * variance.sqrt();
                Band {
                    upper: middle + width,
                    middle,
                    lower: middle - width,
                }
            })
            .collect();

        Ok(bands)
    }

    /// Band for the most recent price.
    pub fn latest(&self, prices: &[f64]) -> Result<Band, Report<IndicatorError>> {
        self.calculate_bands(prices)?
            .last()
            .copied()
            .ok_or_else(|| {
                Report::new(IndicatorError::InsufficientData {
                    required: self.period,
                    available: prices.len(),
                })
            })
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &str {
        "bollinger"
    }

    fn required_prices(&self) -> usize {
        self.period
    }

    /// Returns middle band values only.
    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>> {
        Ok(self
            .calculate_bands(prices)?
            .into_iter()
            .map(|b| b.middle)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_period_below_two_invalid() {
        assert!(BollingerBands::new(BandBasis::Sma, 1, 2.0).is_err());
    }

    #[test]
    fn bollinger_negative_multiplier_invalid() {
        assert!(BollingerBands::new(BandBasis::Ema, 20, -1.0).is_err());
    }

    #[test]
    fn bollinger_insufficient_data() {
        let bb = BollingerBands::new(BandBasis::Ema, 5, 2.0).unwrap();
        assert!(bb.calculate(&[1.0; 4]).is_err());
    }

    #[test]
    fn bollinger_flat_prices_zero_width() {
        let bb = BollingerBands::new(BandBasis::Ema, 3, 2.5).unwrap();
        for band in bb.calculate_bands(&[10.0; 5]).unwrap() {
            assert!((band.upper - 10.0).abs() < 1e-9);
            assert!((band.middle - 10.0).abs() < 1e-9);
            assert!((band.lower - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn bollinger_uses_sample_standard_deviation() {
        let bb = BollingerBands::new(BandBasis::Sma, 3, 1.0).unwrap();
        let band = bb.latest(&[1.0, 2.0, 3.0]).unwrap();
        // mean 2, sample variance (1 + 0 + 1) / 2 = 1
        assert!((band.middle - 2.0).abs() < 1e-9);
        assert!((band.upper - 3.0).abs() < 1e-9);
        assert!((band.lower - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ema_basis_moves_middle_but_width_follows_window() {
        let bb = BollingerBands::new(BandBasis::Ema, 3, 1.0).unwrap();
        let band = bb.latest(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        // EMA: seed 2.0, then 4*0.5 + 2*0.5 = 3.0; window [2,3,4] sample std = 1
        assert!((band.middle - 3.0).abs() < 1e-9);
        assert!((band.upper - 4.0).abs() < 1e-9);
        assert!((band.lower - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bands_are_symmetric_around_middle() {
        let bb = BollingerBands::new(BandBasis::Ema, 3, 2.0).unwrap();
        for band in bb.calculate_bands(&[1.0, 5.0, 2.0, 8.0, 3.0]).unwrap() {
            assert!((band.upper - band.middle - (band.middle - band.lower)).abs() < 1e-9);
        }
    }

    #[test]
    fn basis_parses_known_names() {
        assert_eq!(BandBasis::from_str("ema"), Some(BandBasis::Ema));
        assert_eq!(BandBasis::from_str("sma"), Some(BandBasis::Sma));
        assert_eq!(BandBasis::from_str("wma"), None);
    }
}
