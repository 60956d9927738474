pub mod binance;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExchangeError;
use crate::model::{Candle, PriceObservation, TimeFrame};

/// Market-data source.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn Exchange`).
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Query the current price of `symbol` via REST API.
    fn fetch_price(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<PriceObservation, Report<ExchangeError>>>;

    /// Fetch the most recent `limit` candles via REST API, oldest first.
    ///
    /// The newest candle may still be open (`closed == false`).
    fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>>;

    /// Subscribe to real-time candle updates via WebSocket.
    ///
    /// Sends every update (open and closed) into `tx` until `cancel` is
    /// triggered or the receiver is dropped.
    fn subscribe_klines(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        tx: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;

    /// Check that the configured API key pair is accepted.
    fn verify_credentials(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>>;
}
