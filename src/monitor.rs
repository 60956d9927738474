use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::Report;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EvaluationError;
use crate::exchange::Exchange;
use crate::model::{AlertEvent, Candle, PriceObservation, TimeFrame};
use crate::notifier::Notifier;
use crate::rule::ThresholdRule;
use crate::rule::evaluator::{AlertState, AlertStates, evaluate};
use crate::signal::BandSignal;

const KLINE_CHANNEL_CAPACITY: usize = 256;

/// Evaluate one observation and hand every resulting event to `notifier`.
///
/// Returns the number of events delivered. A failed delivery is logged and
/// not retried: the rule stays triggered, so the alert is not repeated.
pub async fn process_observation(
    observation: &PriceObservation,
    rules: &[ThresholdRule],
    states: &mut AlertStates,
    notifier: &dyn Notifier,
) -> Result<usize, Report<EvaluationError>> {
    let events = evaluate(observation, rules, states)?;

    let mut delivered = 0;
    for event in &events {
        if deliver(event, notifier).await {
            delivered += 1;
        }
    }
    Ok(delivered)
}

async fn deliver(event: &AlertEvent, notifier: &dyn Notifier) -> bool {
    info!(
        alert_id = %event.id,
        rule = %event.rule,
        symbol = event.instrument(),
        kind = %event.kind,
        price = event.observation.price,
        level = event.level,
        "alert fired"
    );

    match notifier.notify(event).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                error = ?e,
                alert_id = %event.id,
                notifier = notifier.name(),
                "failed to deliver alert"
            );
            false
        }
    }
}

/// Poll the price of `symbol` every `interval` and evaluate `rules` until
/// `cancel` fires. Owns the alert state of this instrument.
pub async fn run_threshold_monitor(
    exchange: Arc<dyn Exchange>,
    symbol: String,
    rules: Vec<ThresholdRule>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut states = AlertStates::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        exchange = exchange.name(),
        symbol = %symbol,
        rules = rules.len(),
        interval_secs = interval.as_secs_f64(),
        "threshold monitor started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = exchange.fetch_price(&symbol) => fetched,
        };

        let observation = match fetched {
            Ok(observation) => observation,
            Err(e) => {
                warn!(error = ?e, symbol = %symbol, "price fetch failed (continuing)");
                continue;
            }
        };

        debug!(symbol = %symbol, price = observation.price, "price observed");

        if let Err(e) = process_observation(&observation, &rules, &mut states, notifier.as_ref()).await
        {
            warn!(error = ?e, symbol = %symbol, "observation rejected");
        }
    }

    for rule in &rules {
        if let Some(AlertState::Triggered { since }) = states.get(&rule.name) {
            debug!(
                rule = %rule.name,
                price = since.price,
                since = %since.timestamp,
                "rule still triggered at shutdown"
            );
        }
    }
    info!(
        symbol = %symbol,
        triggered = rules.iter().filter(|r| states.is_triggered(&r.name)).count(),
        "threshold monitor stopped"
    );
}

/// Rolling window of the most recent candles, oldest first.
///
/// An update for the newest candle replaces it; older updates are dropped.
#[derive(Debug)]
pub struct CandleWindow {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            candles: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, candle: Candle) {
        match self.candles.back_mut() {
            Some(last) if last.open_time == candle.open_time => *last = candle,
            Some(last) if last.open_time > candle.open_time => {
                debug!(open_time = %candle.open_time, "stale candle update ignored");
            }
            _ => {
                // A newer candle means the previous one closed; drop its
                // partial close.
                if self.candles.back().is_some_and(|last| !last.closed) {
                    self.candles.pop_back();
                }
                self.candles.push_back(candle);
                while self.candles.len() > self.capacity {
                    self.candles.pop_front();
                }
            }
        }
    }

    /// Whether `next` shows that updates were missed: the newest candle
    /// never got its final update, or whole candles are absent.
    pub fn is_behind(&self, next: &Candle) -> bool {
        match self.candles.back() {
            Some(last) if next.open_time > last.open_time => {
                !last.closed || next.open_time > last.open_time + last.timeframe.duration()
            }
            _ => false,
        }
    }

    pub fn last_closed_open_time(&self) -> Option<DateTime<Utc>> {
        self.candles
            .iter()
            .rev()
            .find(|c| c.closed)
            .map(|c| c.open_time)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

fn close_time(candle: &Candle) -> DateTime<Utc> {
    candle.open_time + candle.timeframe.duration()
}

/// Band evaluation state of one monitor: the signal, its close window and
/// the newest candle already evaluated.
struct BandTracker {
    signal: BandSignal,
    window: CandleWindow,
    timeframe: TimeFrame,
    history: usize,
    last_evaluated: Option<DateTime<Utc>>,
}

impl BandTracker {
    fn is_new(&self, candle: &Candle) -> bool {
        self.last_evaluated.is_none_or(|t| candle.open_time > t)
    }

    /// Merge the latest `history` candles from REST into the window.
    ///
    /// On the first sync the candles only seed the window. Later syncs
    /// evaluate every closed candle the stream missed, oldest first.
    async fn sync_from_rest(&mut self, exchange: &dyn Exchange, notifier: &dyn Notifier) {
        let symbol = self.signal.symbol().to_owned();
        let candles = match exchange
            .fetch_candles(&symbol, self.timeframe, self.history)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!(error = ?e, symbol = %symbol, "historical fetch failed (continuing)");
                return;
            }
        };

        let seeding = self.last_evaluated.is_none();
        let mut replayed = 0;
        for candle in candles {
            let pending = !seeding && candle.closed && self.is_new(&candle);
            let open_time = candle.open_time;
            let closed_at = close_time(&candle);
            self.window.push(candle);

            if pending {
                self.last_evaluated = Some(open_time);
                replayed += 1;
                evaluate_band(&mut self.signal, &self.window, closed_at, notifier).await;
            }
        }
        if seeding {
            self.last_evaluated = self.window.last_closed_open_time();
        }

        info!(
            signal = self.signal.name(),
            symbol = %symbol,
            timeframe = %self.timeframe,
            position = ?self.signal.position(),
            loaded = self.window.len(),
            replayed,
            "candle window synced from REST"
        );
    }

    async fn on_stream_candle(
        &mut self,
        candle: Candle,
        exchange: &dyn Exchange,
        notifier: &dyn Notifier,
    ) {
        if self.window.is_behind(&candle) {
            info!(
                signal = self.signal.name(),
                open_time = %candle.open_time,
                "kline stream gap detected, resyncing"
            );
            self.sync_from_rest(exchange, notifier).await;
        }

        if !candle.closed {
            self.window.push(candle);
            return;
        }

        debug!(
            symbol = %candle.symbol,
            timeframe = %candle.timeframe,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            "candle closed"
        );
        let evaluate = self.is_new(&candle);
        let open_time = candle.open_time;
        let closed_at = close_time(&candle);
        self.window.push(candle);

        if evaluate {
            self.last_evaluated = Some(open_time);
            evaluate_band(&mut self.signal, &self.window, closed_at, notifier).await;
        }
    }
}

/// Load `history` candles, then follow the kline stream and evaluate
/// `signal` on every closed candle until `cancel` fires.
///
/// When the stream skips ahead (after a reconnect, or when the last loaded
/// candle closed before the subscription started) the window is refilled
/// from REST and the missed candles are evaluated in order.
pub async fn run_band_monitor(
    exchange: Arc<dyn Exchange>,
    signal: BandSignal,
    timeframe: TimeFrame,
    history: usize,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    let symbol = signal.symbol().to_owned();
    let mut tracker = BandTracker {
        signal,
        window: CandleWindow::new(history),
        timeframe,
        history,
        last_evaluated: None,
    };

    tracker
        .sync_from_rest(exchange.as_ref(), notifier.as_ref())
        .await;

    let (tx, mut rx) = mpsc::channel::<Candle>(KLINE_CHANNEL_CAPACITY);
    let stream_exchange = Arc::clone(&exchange);
    let stream_symbol = symbol.clone();
    let stream_cancel = cancel.clone();
    let stream = tokio::spawn(async move {
        if let Err(e) = stream_exchange
            .subscribe_klines(&stream_symbol, timeframe, tx, stream_cancel)
            .await
        {
            error!(error = ?e, symbol = %stream_symbol, "kline subscription failed");
        }
    });

    // The stream task owns the only sender, so this ends once it stops.
    while let Some(candle) = rx.recv().await {
        tracker
            .on_stream_candle(candle, exchange.as_ref(), notifier.as_ref())
            .await;
    }

    if let Err(e) = stream.await {
        error!(error = ?e, "kline stream task panicked");
    }
    info!(signal = tracker.signal.name(), "band monitor stopped");
}

async fn evaluate_band(
    signal: &mut BandSignal,
    window: &CandleWindow,
    closed_at: DateTime<Utc>,
    notifier: &dyn Notifier,
) {
    if window.len() < signal.required_prices() {
        debug!(
            signal = signal.name(),
            available = window.len(),
            required = signal.required_prices(),
            "insufficient candles for bands"
        );
        return;
    }

    match signal.on_closed_candle(&window.closes(), closed_at) {
        Ok(Some(event)) => {
            deliver(&event, notifier).await;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = ?e, signal = signal.name(), "band calculation failed");
        }
    }
}
