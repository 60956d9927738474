use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{AlertKind, TimeFrame};

pub const ENV_EXCHANGE_API_KEY: &str = "API_KEY_BINANCE";
pub const ENV_EXCHANGE_API_SECRET: &str = "SECRET_KEY_BINANCE";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_exchange_base_url() -> String {
    "https://api.binance.com".into()
}

fn default_exchange_ws_url() -> String {
    "wss://stream.binance.com:9443/stream".into()
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_band_period() -> usize {
    20
}

fn default_std_dev_multiplier() -> f64 {
    2.5
}

fn default_basis() -> String {
    "ema".into()
}

fn default_historical_candles() -> usize {
    720
}

fn default_position() -> String {
    "flat".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub bands: Vec<BandConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_base_url")]
    pub base_url: String,
    #[serde(default = "default_exchange_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Run a signed account query at startup to check the API key pair.
    #[serde(default = "default_true")]
    pub verify_credentials: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_exchange_base_url(),
            ws_url: default_exchange_ws_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            verify_credentials: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: default_telegram_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub symbol: String,
    pub kind: AlertKind,
    pub boundary: f64,
    #[serde(default)]
    pub rearm_band: f64,
}

#[derive(Debug, Deserialize)]
pub struct BandConfig {
    pub name: String,
    pub symbol: String,
    pub timeframe: String,
    #[serde(default = "default_band_period")]
    pub period: usize,
    #[serde(default = "default_std_dev_multiplier")]
    pub std_dev_multiplier: f64,
    /// `"ema"` | `"sma"`
    #[serde(default = "default_basis")]
    pub basis: String,
    #[serde(default = "default_historical_candles")]
    pub historical_candles: usize,
    /// `"flat"` | `"long"`
    #[serde(default = "default_position")]
    pub initial_position: String,
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

const VALID_BASES: &[&str] = &["ema", "sma"];
const VALID_POSITIONS: &[&str] = &["flat", "long"];
/// Largest kline page the exchange serves in one request.
const MAX_HISTORICAL_CANDLES: usize = 1000;

fn invalid(field: String) -> Report<ConfigError> {
    Report::new(ConfigError::Validation { field })
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_monitor(config)?;
    validate_names_unique(config)?;
    validate_rules(config)?;
    validate_bands(config)?;
    Ok(())
}

fn validate_monitor(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.monitor.poll_interval_secs == 0 {
        return Err(invalid("monitor.poll_interval_secs must be > 0".into()));
    }
    if config.exchange.request_timeout_secs == 0 || config.telegram.request_timeout_secs == 0 {
        return Err(invalid("request_timeout_secs must be > 0".into()));
    }
    Ok(())
}

fn validate_names_unique(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    let names = config
        .rules
        .iter()
        .map(|r| r.name.as_str())
        .chain(config.bands.iter().map(|b| b.name.as_str()));

    for name in names {
        if name.trim().is_empty() {
            return Err(invalid("rule and band names must not be empty".into()));
        }
        if !seen.insert(name) {
            return Err(invalid(format!("duplicate rule/band name \"{name}\"")));
        }
    }
    Ok(())
}

fn validate_rules(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for rule in &config.rules {
        if rule.symbol.trim().is_empty() {
            return Err(invalid(format!("rules[\"{}\"].symbol is empty", rule.name)));
        }
        if !rule.boundary.is_finite() || rule.boundary <= 0.0 {
            return Err(invalid(format!(
                "rules[\"{}\"].boundary must be a positive number",
                rule.name
            )));
        }
        if !rule.rearm_band.is_finite() || rule.rearm_band < 0.0 {
            return Err(invalid(format!(
                "rules[\"{}\"].rearm_band must be >= 0",
                rule.name
            )));
        }
    }
    Ok(())
}

fn validate_bands(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    for band in &config.bands {
        if band.symbol.trim().is_empty() {
            return Err(invalid(format!("bands[\"{}\"].symbol is empty", band.name)));
        }
        if TimeFrame::from_str(&band.timeframe).is_none() {
            return Err(invalid(format!(
                "bands[\"{}\"].timeframe: unknown timeframe \"{}\"",
                band.name, band.timeframe
            )));
        }
        if band.period < 2 {
            return Err(invalid(format!("bands[\"{}\"].period must be >= 2", band.name)));
        }
        if !band.std_dev_multiplier.is_finite() || band.std_dev_multiplier <= 0.0 {
            return Err(invalid(format!(
                "bands[\"{}\"].std_dev_multiplier must be > 0",
                band.name
            )));
        }
        if !VALID_BASES.contains(&band.basis.as_str()) {
            return Err(invalid(format!(
                "bands[\"{}\"].basis \"{}\" is not valid",
                band.name, band.basis
            )));
        }
        if !VALID_POSITIONS.contains(&band.initial_position.as_str()) {
            return Err(invalid(format!(
                "bands[\"{}\"].initial_position \"{}\" is not valid",
                band.name, band.initial_position
            )));
        }
        if band.historical_candles < band.period
            || band.historical_candles > MAX_HISTORICAL_CANDLES
        {
            return Err(invalid(format!(
                "bands[\"{}\"].historical_candles must be between period and {MAX_HISTORICAL_CANDLES}",
                band.name
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Clone)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

/// Secrets supplied through the environment. Only adapters receive them.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub exchange: ExchangeCredentials,
    pub telegram: Option<TelegramCredentials>,
}

impl Secrets {
    /// Read secrets from the process environment.
    ///
    /// Telegram credentials are mandatory unless `require_telegram` is false,
    /// in which case they are picked up only when both are present.
    pub fn from_env(require_telegram: bool) -> Result<Self, Report<ConfigError>> {
        Self::from_lookup(|name| std::env::var(name).ok(), require_telegram)
    }

    pub fn from_lookup<F>(lookup: F, require_telegram: bool) -> Result<Self, Report<ConfigError>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &str| {
            fetch(name).ok_or_else(|| {
                Report::new(ConfigError::MissingEnv {
                    name: name.to_owned(),
                })
            })
        };

        let exchange = ExchangeCredentials {
            api_key: require(ENV_EXCHANGE_API_KEY)?,
            api_secret: require(ENV_EXCHANGE_API_SECRET)?,
        };

        let telegram = if require_telegram {
            Some(TelegramCredentials {
                bot_token: require(ENV_TELEGRAM_BOT_TOKEN)?,
                chat_id: require(ENV_TELEGRAM_CHAT_ID)?,
            })
        } else {
            match (fetch(ENV_TELEGRAM_BOT_TOKEN), fetch(ENV_TELEGRAM_CHAT_ID)) {
                (Some(bot_token), Some(chat_id)) => Some(TelegramCredentials { bot_token, chat_id }),
                _ => None,
            }
        };

        Ok(Self { exchange, telegram })
    }
}

impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}
