pub mod bollinger;
pub mod ma;

use error_stack::Report;

use crate::error::IndicatorError;

/// A technical analysis indicator over a price series.
///
/// Prices must be in ascending chronological order (oldest first).
pub trait Indicator: Send + Sync {
    /// Unique name of this indicator (e.g., "sma", "ema").
    fn name(&self) -> &str;

    /// Minimum number of prices required to produce at least one output value.
    fn required_prices(&self) -> usize;

    /// Calculate indicator values from prices.
    ///
    /// The output may be shorter than the input depending on the
    /// indicator's lookback; the last value always lines up with the last
    /// price.
    fn calculate(&self, prices: &[f64]) -> Result<Vec<f64>, Report<IndicatorError>>;
}
