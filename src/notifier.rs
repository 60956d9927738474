pub mod telegram;
pub mod terminal;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::model::{AlertEvent, AlertKind};

/// Sink for alert notifications.
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify<'a>(&'a self, event: &'a AlertEvent)
    -> BoxFuture<'a, Result<(), Report<NotifyError>>>;
}

/// Human-readable rendering of an `AlertEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub headline: String,
    pub details: String,
}

impl AlertMessage {
    pub fn from_event(event: &AlertEvent) -> Self {
        let action = match event.kind {
            AlertKind::Buy => "buy",
            AlertKind::Sell => "sell",
        };
        let headline = format!("A {action} signal was generated for {}!", event.instrument());
        let details = format!(
            "rule: {}\nprice: {} (level {})\ntime: {}",
            event.rule,
            event.observation.price,
            event.level,
            event.observation.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        Self { headline, details }
    }

    pub fn to_plain(&self) -> String {
        format!("{}\n{}", self.headline, self.details)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::PriceObservation;

    #[test]
    fn message_names_instrument_rule_and_prices() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let event = AlertEvent::new(
            "btc dip",
            AlertKind::Buy,
            PriceObservation::new("BTCUSDT", 29500.5, ts),
            30000.0,
        );
        let message = AlertMessage::from_event(&event);
        assert_eq!(message.headline, "A buy signal was generated for BTCUSDT!");
        assert_eq!(
            message.details,
            "rule: btc dip\nprice: 29500.5 (level 30000)\ntime: 2024-03-01 12:30:00 UTC"
        );
        assert!(message.to_plain().starts_with("A buy signal"));
    }

    #[test]
    fn sell_headline() {
        let event = AlertEvent::new(
            "top",
            AlertKind::Sell,
            PriceObservation::new("ETHUSDT", 4100.0, Utc::now()),
            4000.0,
        );
        assert_eq!(
            AlertMessage::from_event(&event).headline,
            "A sell signal was generated for ETHUSDT!"
        );
    }
}
