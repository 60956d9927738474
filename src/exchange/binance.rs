use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use nonzero_ext::nonzero;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, ExchangeCredentials};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{Candle, PriceObservation, TimeFrame};
use crate::retry::{RetryPolicy, retry};

const TICKER_PRICE_PATH: &str = "/api/v3/ticker/price";
const KLINES_PATH: &str = "/api/v3/klines";
const ACCOUNT_PATH: &str = "/api/v3/account";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const MAX_CANDLES_PER_REQUEST: usize = 1000;
const RECV_WINDOW_MS: u64 = 5000;
// Reconnect before 24-hour auto-disconnect (23 hours)
const WS_RECONNECT_SECS: u64 = 23 * 60 * 60;
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceExchange {
    client: reqwest::Client,
    base_url: String,
    ws_url: String,
    credentials: ExchangeCredentials,
    retry: RetryPolicy,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl BinanceExchange {
    pub fn new(
        config: &ExchangeConfig,
        credentials: ExchangeCredentials,
    ) -> Result<Self, Report<ExchangeError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .change_context(ExchangeError::Connection {
                endpoint: config.base_url.clone(),
            })?;

        // Market data endpoints cost weight 2-4; 20 req/s stays far below
        // the 6000 weight/min IP limit.
        let quota = Quota::per_second(nonzero!(20u32));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            ws_url: config.ws_url.clone(),
            credentials,
            retry: RetryPolicy::new(config.max_retries),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Report<ExchangeError>> {
        // Wait for rate limiter before making the request
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, self.credentials.api_key.as_str())
            .query(query)
            .send()
            .await
            .change_context(ExchangeError::Request {
                endpoint: path.to_owned(),
            })?;

        read_json(response, path).await
    }

    async fn get_signed_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, Report<ExchangeError>> {
        self.rate_limiter.until_ready().await;

        let mut params = query.to_vec();
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query_string = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign_request(&self.credentials.api_secret, &query_string)?;

        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, self.credentials.api_key.as_str())
            .send()
            .await
            .change_context(ExchangeError::Request {
                endpoint: path.to_owned(),
            })?;

        read_json(response, path).await
    }
}

impl Exchange for BinanceExchange {
    fn name(&self) -> &str {
        "binance"
    }

    fn fetch_price(
        &self,
        symbol: &str,
    ) -> BoxFuture<'_, Result<PriceObservation, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let query = [("symbol", symbol.clone())];
            let query = &query[..];

            let raw: BinanceTickerPrice = retry(&self.retry, "binance ticker price", move || {
                self.get_json(TICKER_PRICE_PATH, query)
            })
            .await
            .attach_with(|| format!("symbol: {symbol}"))?;

            raw.into_observation()
        })
    }

    fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            let fetch_limit = limit.clamp(1, MAX_CANDLES_PER_REQUEST);
            let query = [
                ("symbol", symbol.clone()),
                ("interval", timeframe.as_str().to_owned()),
                ("limit", fetch_limit.to_string()),
            ];
            let query = &query[..];

            let raw: Vec<BinanceKlineRow> = retry(&self.retry, "binance klines", move || {
                self.get_json(KLINES_PATH, query)
            })
            .await
            .attach_with(|| format!("symbol: {symbol}, timeframe: {timeframe}"))?;

            info!(
                symbol = %symbol,
                timeframe = %timeframe,
                fetched = raw.len(),
                "binance candle fetch complete"
            );

            let now_ms = Utc::now().timestamp_millis();
            raw.into_iter()
                .map(|row| row.into_candle(&symbol, timeframe, now_ms))
                .collect()
        })
    }

    fn subscribe_klines(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        tx: mpsc::Sender<Candle>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        let url = kline_stream_url(&self.ws_url, symbol, timeframe);
        Box::pin(async move {
            follow_kline_stream(&url, timeframe, &tx, &cancel, StreamTiming::default()).await;
            Ok(())
        })
    }

    fn verify_credentials(&self) -> BoxFuture<'_, Result<(), Report<ExchangeError>>> {
        Box::pin(async move {
            let query = [("omitZeroBalances", "true".to_owned())];
            let query = &query[..];

            let account: BinanceAccount = retry(&self.retry, "binance account", move || {
                self.get_signed_json(ACCOUNT_PATH, query)
            })
            .await?;

            info!(
                account_type = %account.account_type,
                can_trade = account.can_trade,
                "binance credentials verified"
            );
            Ok(())
        })
    }
}

async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T, Report<ExchangeError>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Report::new(ExchangeError::Request {
            endpoint: path.to_owned(),
        })
        .attach(format!("HTTP status: {status}"))
        .attach(format!("body: {body}")));
    }

    response
        .json()
        .await
        .change_context(ExchangeError::ResponseParse {
            endpoint: path.to_owned(),
        })
}

/// HMAC-SHA256 signature of a query string, hex encoded, as Binance expects
/// for `SIGNED` endpoints.
fn sign_request(secret: &str, query_string: &str) -> Result<String, Report<ExchangeError>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        Report::new(ExchangeError::Request {
            endpoint: ACCOUNT_PATH.to_owned(),
        })
        .attach("invalid HMAC key")
    })?;
    mac.update(query_string.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn kline_stream_url(ws_url: &str, symbol: &str, timeframe: TimeFrame) -> String {
    format!(
        "{}?streams={}@kline_{}",
        ws_url,
        symbol.to_lowercase(),
        timeframe.as_str()
    )
}

fn parse_price(value: &str, endpoint: &str) -> Result<f64, Report<ExchangeError>> {
    value
        .parse::<f64>()
        .change_context(ExchangeError::ResponseParse {
            endpoint: endpoint.to_owned(),
        })
        .attach_with(|| format!("value: {value:?}"))
}

/// Reconnect pacing of the kline stream.
#[derive(Debug, Clone, Copy)]
struct StreamTiming {
    initial_backoff: Duration,
    max_backoff: Duration,
    /// A session is closed and reopened once it is this old.
    session_lifetime: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
            session_lifetime: Duration::from_secs(WS_RECONNECT_SECS),
        }
    }
}

/// How a kline session ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Cancelled, or the receiver went away.
    Stopped,
    /// The session reached its lifetime and should be reopened at once.
    Expired,
}

/// Keep a kline session open until `cancel` fires or `tx` is closed.
///
/// Failed sessions are retried with capped exponential backoff. The backoff
/// starts over after any session that delivered candles, and an expired
/// session is reopened without delay.
async fn follow_kline_stream(
    url: &str,
    timeframe: TimeFrame,
    tx: &mpsc::Sender<Candle>,
    cancel: &CancellationToken,
    timing: StreamTiming,
) {
    let mut backoff = timing.initial_backoff;

    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }

        let mut delivered = 0;
        let result = run_kline_ws(
            url,
            timeframe,
            tx,
            cancel,
            timing.session_lifetime,
            &mut delivered,
        )
        .await;

        match result {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Expired) => {
                info!(url, delivered, "binance kline ws session expired, reconnecting");
                backoff = timing.initial_backoff;
            }
            Err(e) => {
                if delivered > 0 {
                    backoff = timing.initial_backoff;
                }
                warn!(
                    error = %e,
                    url,
                    delivered,
                    backoff_ms = backoff.as_millis() as u64,
                    "binance kline ws disconnected, retrying..."
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(timing.max_backoff);
            }
        }
    }
}

async fn run_kline_ws(
    url: &str,
    timeframe: TimeFrame,
    tx: &mpsc::Sender<Candle>,
    cancel: &CancellationToken,
    lifetime: Duration,
    delivered: &mut usize,
) -> Result<SessionEnd, Report<ExchangeError>> {
    let (ws_stream, _) = connect_async(url)
        .await
        .change_context(ExchangeError::Connection {
            endpoint: url.to_owned(),
        })?;

    let (mut write, mut read) = ws_stream.split();

    info!(url, "binance kline ws connected");

    let expiry = tokio::time::sleep(lifetime);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("binance kline ws cancelled");
                return Ok(SessionEnd::Stopped);
            }
            _ = &mut expiry => {
                let _ = write.close().await;
                return Ok(SessionEnd::Expired);
            }
            msg = read.next() => {
                match msg {
                    None => {
                        return Err(Report::new(ExchangeError::Connection {
                            endpoint: url.to_owned(),
                        })
                        .attach("stream closed by server"));
                    }
                    Some(Err(e)) => return Err(Report::new(e)
                        .change_context(ExchangeError::Connection {
                            endpoint: url.to_owned(),
                        })),
                    Some(Ok(Message::Text(text))) => {
                        let candle = serde_json::from_str::<BinanceCombinedMsg<BinanceKlineEvent>>(&text)
                            .map_err(|e| Report::new(e).change_context(ExchangeError::ResponseParse {
                                endpoint: url.to_owned(),
                            }))
                            .and_then(|combined| combined.data.kline.into_candle(timeframe));
                        match candle {
                            Ok(candle) => {
                                if tx.send(candle).await.is_err() {
                                    debug!("kline receiver dropped, closing ws");
                                    return Ok(SessionEnd::Stopped);
                                }
                                *delivered += 1;
                            }
                            Err(e) => {
                                warn!(error = ?e, raw = %text, "binance kline parse error");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Server sends ping every 20s; must pong within 60s
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BinanceTickerPrice {
    symbol: String,
    price: String,
}

impl BinanceTickerPrice {
    fn into_observation(self) -> Result<PriceObservation, Report<ExchangeError>> {
        let price = parse_price(&self.price, TICKER_PRICE_PATH)?;
        Ok(PriceObservation::new(self.symbol, price, Utc::now()))
    }
}

/// Binance kline row: 12-element array
/// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct BinanceKlineRow(
    i64,        // 0: open_time (ms)
    String,     // 1: open
    String,     // 2: high
    String,     // 3: low
    String,     // 4: close
    String,     // 5: volume
    i64,        // 6: close_time (ms)
    IgnoredAny, // 7: quote asset volume
    IgnoredAny, // 8: number of trades
    IgnoredAny, // 9: taker buy base volume
    IgnoredAny, // 10: taker buy quote volume
    IgnoredAny, // 11: ignore
);

impl BinanceKlineRow {
    fn into_candle(
        self,
        symbol: &str,
        timeframe: TimeFrame,
        now_ms: i64,
    ) -> Result<Candle, Report<ExchangeError>> {
        let open_time = DateTime::from_timestamp_millis(self.0).unwrap_or_else(Utc::now);

        Ok(Candle {
            symbol: symbol.to_owned(),
            timeframe,
            open_time,
            open: parse_price(&self.1, KLINES_PATH)?,
            high: parse_price(&self.2, KLINES_PATH)?,
            low: parse_price(&self.3, KLINES_PATH)?,
            close: parse_price(&self.4, KLINES_PATH)?,
            volume: parse_price(&self.5, KLINES_PATH)?,
            closed: self.6 < now_ms,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BinanceAccount {
    #[serde(rename = "accountType")]
    account_type: String,
    #[serde(rename = "canTrade")]
    can_trade: bool,
}

// ── WebSocket message types ───────────────────────────────────────────────────

/// Combined stream wrapper: `{ "stream": "...", "data": { ... } }`
#[derive(Debug, Deserialize)]
struct BinanceCombinedMsg<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
struct BinanceKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    /// Whether this kline is closed
    #[serde(rename = "x")]
    closed: bool,
}

impl BinanceKline {
    fn into_candle(self, timeframe: TimeFrame) -> Result<Candle, Report<ExchangeError>> {
        const ENDPOINT: &str = "kline stream";
        let open_time = DateTime::from_timestamp_millis(self.open_time).unwrap_or_else(Utc::now);

        Ok(Candle {
            symbol: self.symbol,
            timeframe,
            open_time,
            open: parse_price(&self.open, ENDPOINT)?,
            high: parse_price(&self.high, ENDPOINT)?,
            low: parse_price(&self.low, ENDPOINT)?,
            close: parse_price(&self.close, ENDPOINT)?,
            volume: parse_price(&self.volume, ENDPOINT)?,
            closed: self.closed,
        })
    }
}
