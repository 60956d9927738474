use std::collections::HashMap;

use error_stack::{Report, bail};

use crate::error::EvaluationError;
use crate::model::{AlertEvent, PriceObservation};
use crate::rule::ThresholdRule;

/// Per-rule trigger state.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertState {
    NotTriggered,
    /// The rule fired on `since` and has not been re-armed yet.
    Triggered { since: PriceObservation },
}

/// Trigger state of every rule of one instrument, keyed by rule name.
///
/// Rules without an entry are `NotTriggered`.
#[derive(Debug, Default)]
pub struct AlertStates {
    states: HashMap<String, AlertState>,
}

impl AlertStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rule_name: &str) -> Option<&AlertState> {
        self.states.get(rule_name)
    }

    pub fn is_triggered(&self, rule_name: &str) -> bool {
        matches!(self.get(rule_name), Some(AlertState::Triggered { .. }))
    }

    fn entry(&mut self, rule_name: &str) -> &mut AlertState {
        self.states
            .entry(rule_name.to_owned())
            .or_insert(AlertState::NotTriggered)
    }
}

/// Evaluate one observation against `rules`, updating `states`.
///
/// Returns one event per rule that moved from not-triggered to triggered, in
/// rule order. Rules for other instruments are skipped. Inputs are validated
/// before any state changes, so a failed call leaves `states` untouched.
pub fn evaluate(
    observation: &PriceObservation,
    rules: &[ThresholdRule],
    states: &mut AlertStates,
) -> Result<Vec<AlertEvent>, Report<EvaluationError>> {
    validate_observation(observation)?;
    for rule in rules {
        rule.validate()?;
    }

    let events = rules
        .iter()
        .filter(|rule| rule.symbol == observation.instrument)
        .filter_map(|rule| advance(states.entry(&rule.name), rule, observation))
        .collect();

    Ok(events)
}

fn advance(
    state: &mut AlertState,
    rule: &ThresholdRule,
    observation: &PriceObservation,
) -> Option<AlertEvent> {
    let price = observation.price;
    match state {
        AlertState::NotTriggered if rule.holds(price) => {
            *state = AlertState::Triggered {
                since: observation.clone(),
            };
            Some(AlertEvent::new(
                rule.name.clone(),
                rule.kind,
                observation.clone(),
                rule.boundary,
            ))
        }
        AlertState::Triggered { .. } if rule.rearms(price) => {
            tracing::debug!(rule = %rule.name, price, "rule re-armed");
            *state = AlertState::NotTriggered;
            None
        }
        _ => None,
    }
}

fn validate_observation(observation: &PriceObservation) -> Result<(), Report<EvaluationError>> {
    let price = observation.price;
    if !price.is_finite() || price <= 0.0 {
        bail!(EvaluationError::InvalidObservation {
            instrument: observation.instrument.clone(),
            reason: format!("price {price} must be finite and > 0"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::model::AlertKind;

    const SYMBOL: &str = "BTCUSDT";

    fn obs(price: f64) -> PriceObservation {
        PriceObservation::new(SYMBOL, price, Utc::now())
    }

    fn buy(boundary: f64) -> ThresholdRule {
        ThresholdRule::new("buy-rule", SYMBOL, AlertKind::Buy, boundary)
    }

    fn sell(boundary: f64) -> ThresholdRule {
        ThresholdRule::new("sell-rule", SYMBOL, AlertKind::Sell, boundary)
    }

    /// Feed `prices` one by one and collect every emitted event.
    fn run(rules: &[ThresholdRule], prices: &[f64]) -> Vec<AlertEvent> {
        let mut states = AlertStates::new();
        prices
            .iter()
            .flat_map(|&p| evaluate(&obs(p), rules, &mut states).unwrap())
            .collect()
    }

    #[test]
    fn staying_below_after_crossing_fires_once() {
        let events = run(&[buy(100.0)], &[110.0, 99.0, 98.0, 50.0, 99.9, 1.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertKind::Buy);
        assert_eq!(events[0].observation.price, 99.0);
    }

    #[test]
    fn oscillation_fires_once_per_crossing() {
        let mut prices = vec![110.0];
        for _ in 0..4 {
            prices.extend([90.0, 110.0]);
        }
        let events = run(&[buy(100.0)], &prices);
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn buy_scenario_with_reset_between_dips() {
        let events = run(&[buy(30_000.0)], &[31_000.0, 29_500.0, 30_200.0, 29_000.0]);
        let prices: Vec<f64> = events.iter().map(|e| e.observation.price).collect();
        assert_eq!(prices, vec![29_500.0, 29_000.0]);
        assert!(events.iter().all(|e| e.kind == AlertKind::Buy));
        assert!(events.iter().all(|e| e.level == 30_000.0));
    }

    #[test]
    fn dip_that_never_recovers_above_boundary_does_not_refire() {
        // 29800 is still below 30000, so the rule stays triggered.
        let events = run(&[buy(30_000.0)], &[31_000.0, 29_500.0, 29_800.0, 29_000.0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].observation.price, 29_500.0);
    }

    #[test]
    fn repeated_observation_fires_only_first_time() {
        let rules = [buy(100.0)];
        let mut states = AlertStates::new();
        let observation = obs(95.0);

        let first = evaluate(&observation, &rules, &mut states).unwrap();
        let second = evaluate(&observation, &rules, &mut states).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(states.is_triggered("buy-rule"));
    }

    #[test]
    fn price_equal_to_boundary_triggers_both_kinds() {
        assert_eq!(run(&[buy(100.0)], &[100.0]).len(), 1);
        assert_eq!(run(&[sell(100.0)], &[100.0]).len(), 1);
        assert!(run(&[buy(100.0)], &[100.000_001]).is_empty());
        assert!(run(&[sell(100.0)], &[99.999_999]).is_empty());
    }

    #[test]
    fn sell_fires_on_rise_and_rearms_on_fall() {
        let events = run(&[sell(200.0)], &[150.0, 210.0, 220.0, 190.0, 205.0]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == AlertKind::Sell));
    }

    #[test]
    fn triggered_state_records_the_firing_observation() {
        let rules = [buy(100.0)];
        let mut states = AlertStates::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = PriceObservation::new(SYMBOL, 90.0, t0);
        let later = PriceObservation::new(SYMBOL, 80.0, t0 + Duration::minutes(1));

        evaluate(&first, &rules, &mut states).unwrap();
        evaluate(&later, &rules, &mut states).unwrap();

        assert_eq!(
            states.get("buy-rule"),
            Some(&AlertState::Triggered { since: first })
        );
    }

    #[test]
    fn reset_emits_nothing_and_clears_state() {
        let rules = [buy(100.0)];
        let mut states = AlertStates::new();
        evaluate(&obs(90.0), &rules, &mut states).unwrap();

        let events = evaluate(&obs(120.0), &rules, &mut states).unwrap();

        assert!(events.is_empty());
        assert_eq!(states.get("buy-rule"), Some(&AlertState::NotTriggered));
    }

    #[test]
    fn rearm_band_suppresses_jitter_around_boundary() {
        let rules = [buy(100.0).with_rearm_band(5.0)];
        let events = run(&rules, &[110.0, 99.0, 103.0, 98.0, 106.0, 97.0]);
        let prices: Vec<f64> = events.iter().map(|e| e.observation.price).collect();
        assert_eq!(prices, vec![99.0, 97.0]);
    }

    #[test]
    fn events_follow_rule_order() {
        let rules = [
            ThresholdRule::new("c", SYMBOL, AlertKind::Buy, 300.0),
            ThresholdRule::new("a", SYMBOL, AlertKind::Sell, 10.0),
            ThresholdRule::new("b", SYMBOL, AlertKind::Buy, 200.0),
        ];
        let events = run(&rules, &[150.0]);
        let names: Vec<&str> = events.iter().map(|e| e.rule.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn rules_for_other_instruments_are_skipped() {
        let rules = [ThresholdRule::new("eth", "ETHUSDT", AlertKind::Buy, 1e9)];
        let mut states = AlertStates::new();
        let events = evaluate(&obs(10.0), &rules, &mut states).unwrap();
        assert!(events.is_empty());
        assert!(states.get("eth").is_none());
    }

    #[test]
    fn no_rules_no_events() {
        assert!(run(&[], &[1.0, 2.0]).is_empty());
    }

    #[test]
    fn negative_price_is_invalid_observation() {
        let mut states = AlertStates::new();
        let report = evaluate(&obs(-5.0), &[buy(100.0)], &mut states).unwrap_err();
        assert!(matches!(
            report.current_context(),
            EvaluationError::InvalidObservation { .. }
        ));
    }

    #[test]
    fn zero_and_non_finite_prices_are_invalid() {
        let mut states = AlertStates::new();
        for price in [0.0, f64::NAN, f64::INFINITY] {
            assert!(evaluate(&obs(price), &[buy(100.0)], &mut states).is_err());
        }
    }

    #[test]
    fn nan_boundary_is_invalid_rule() {
        let mut states = AlertStates::new();
        let report = evaluate(&obs(50.0), &[buy(f64::NAN)], &mut states).unwrap_err();
        assert!(matches!(
            report.current_context(),
            EvaluationError::InvalidRule { .. }
        ));
    }

    #[test]
    fn invalid_rule_leaves_state_untouched() {
        let good = buy(100.0);
        let bad = ThresholdRule::new("bad", SYMBOL, AlertKind::Sell, f64::NAN);
        let mut states = AlertStates::new();

        assert!(evaluate(&obs(50.0), &[good, bad], &mut states).is_err());
        assert!(states.get("buy-rule").is_none());
    }
}
