use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;
use crate::model::AlertEvent;
use crate::notifier::{AlertMessage, Notifier};

/// Writes alerts to the log instead of sending them anywhere.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn name(&self) -> &str {
        "terminal"
    }

    fn notify<'a>(
        &'a self,
        event: &'a AlertEvent,
    ) -> BoxFuture<'a, Result<(), Report<NotifyError>>> {
        Box::pin(async move {
            let message = AlertMessage::from_event(event);
            tracing::warn!(
                alert_id = %event.id,
                rule = %event.rule,
                symbol = event.instrument(),
                kind = %event.kind,
                price = event.observation.price,
                level = event.level,
                "ALERT: {}",
                message.to_plain(),
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{AlertKind, PriceObservation};

    #[tokio::test]
    async fn terminal_notifier_always_succeeds() {
        let event = AlertEvent::new(
            "test",
            AlertKind::Buy,
            PriceObservation::new("BTCUSDT", 120.0, Utc::now()),
            125.0,
        );
        assert!(TerminalNotifier.notify(&event).await.is_ok());
    }
}
