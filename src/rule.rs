pub mod evaluator;

use error_stack::{Report, bail};

use crate::config::{AppConfig, RuleConfig};
use crate::error::EvaluationError;
use crate::model::AlertKind;

/// A price boundary that raises a buy or sell alert when reached.
///
/// The comparison is inclusive on both sides: a BUY rule holds when
/// `price <= boundary`, a SELL rule when `price >= boundary`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub name: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub boundary: f64,
    /// Distance past the boundary the price must travel, once triggered,
    /// before the rule can fire again.
    pub rearm_band: f64,
}

impl ThresholdRule {
    pub fn new(
        name: impl Into<String>,
        symbol: impl Into<String>,
        kind: AlertKind,
        boundary: f64,
    ) -> Self {
        Self {
            name: name.into(),
            symbol: symbol.into(),
            kind,
            boundary,
            rearm_band: 0.0,
        }
    }

    pub fn with_rearm_band(mut self, rearm_band: f64) -> Self {
        self.rearm_band = rearm_band;
        self
    }

    /// Build all `ThresholdRule`s from a validated `AppConfig`.
    pub fn from_config(config: &AppConfig) -> Vec<Self> {
        config.rules.iter().map(build_rule).collect()
    }

    /// Whether the rule's alert condition holds at `price`.
    pub fn holds(&self, price: f64) -> bool {
        match self.kind {
            AlertKind::Buy => price <= self.boundary,
            AlertKind::Sell => price >= self.boundary,
        }
    }

    /// Whether a triggered rule should be re-armed at `price`.
    pub fn rearms(&self, price: f64) -> bool {
        match self.kind {
            AlertKind::Buy => price > self.boundary + self.rearm_band,
            AlertKind::Sell => price < self.boundary - self.rearm_band,
        }
    }

    pub fn validate(&self) -> Result<(), Report<EvaluationError>> {
        if !self.boundary.is_finite() {
            bail!(EvaluationError::InvalidRule {
                rule: self.name.clone(),
                reason: format!("boundary {} is not finite", self.boundary),
            });
        }
        if !self.rearm_band.is_finite() || self.rearm_band < 0.0 {
            bail!(EvaluationError::InvalidRule {
                rule: self.name.clone(),
                reason: format!("rearm band {} must be finite and >= 0", self.rearm_band),
            });
        }
        Ok(())
    }
}

fn build_rule(rule: &RuleConfig) -> ThresholdRule {
    ThresholdRule::new(rule.name.clone(), rule.symbol.clone(), rule.kind, rule.boundary)
        .with_rearm_band(rule.rearm_band)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_holds_at_and_below_boundary() {
        let rule = ThresholdRule::new("b", "BTCUSDT", AlertKind::Buy, 30_000.0);
        assert!(rule.holds(29_999.0));
        assert!(rule.holds(30_000.0));
        assert!(!rule.holds(30_000.01));
    }

    #[test]
    fn sell_holds_at_and_above_boundary() {
        let rule = ThresholdRule::new("s", "BTCUSDT", AlertKind::Sell, 70_000.0);
        assert!(rule.holds(70_001.0));
        assert!(rule.holds(70_000.0));
        assert!(!rule.holds(69_999.99));
    }

    #[test]
    fn rearm_band_widens_reset_level() {
        let buy = ThresholdRule::new("b", "X", AlertKind::Buy, 100.0).with_rearm_band(5.0);
        assert!(!buy.rearms(103.0));
        assert!(!buy.rearms(105.0));
        assert!(buy.rearms(105.5));

        let sell = ThresholdRule::new("s", "X", AlertKind::Sell, 100.0).with_rearm_band(5.0);
        assert!(!sell.rearms(97.0));
        assert!(sell.rearms(94.0));
    }

    #[test]
    fn zero_band_rearms_as_soon_as_condition_fails() {
        let buy = ThresholdRule::new("b", "X", AlertKind::Buy, 100.0);
        for price in [99.0, 100.0, 100.5, 101.0] {
            assert_eq!(buy.rearms(price), !buy.holds(price));
        }
    }

    #[test]
    fn non_finite_boundary_is_invalid() {
        let rule = ThresholdRule::new("nan", "X", AlertKind::Buy, f64::NAN);
        let report = rule.validate().unwrap_err();
        assert!(matches!(
            report.current_context(),
            EvaluationError::InvalidRule { rule, .. } if rule == "nan"
        ));
        assert!(ThresholdRule::new("inf", "X", AlertKind::Sell, f64::INFINITY)
            .validate()
            .is_err());
    }

    #[test]
    fn negative_rearm_band_is_invalid() {
        let rule = ThresholdRule::new("b", "X", AlertKind::Buy, 1.0).with_rearm_band(-0.5);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn from_config_builds_rules_in_order() {
        let config: AppConfig = toml::from_str(
            r#"
[general]

[[rules]]
name = "dip"
symbol = "BTCUSDT"
kind = "buy"
boundary = 30000.0
rearm_band = 100.0

[[rules]]
name = "top"
symbol = "ETHUSDT"
kind = "sell"
boundary = 4000.0
"#,
        )
        .unwrap();

        let rules = ThresholdRule::from_config(&config);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "dip");
        assert_eq!(rules[0].kind, AlertKind::Buy);
        assert_eq!(rules[0].rearm_band, 100.0);
        assert_eq!(rules[1].symbol, "ETHUSDT");
        assert_eq!(rules[1].kind, AlertKind::Sell);
    }
}
