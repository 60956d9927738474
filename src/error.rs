use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
    #[display("missing environment variable {name}")]
    MissingEnv { name: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {endpoint}")]
    Connection { endpoint: String },
    #[display("request to {endpoint} failed")]
    Request { endpoint: String },
    #[display("failed to parse response from {endpoint}")]
    ResponseParse { endpoint: String },
}

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("failed to send message via {notifier}")]
    Request { notifier: String },
    #[display("{notifier} rejected the message: {description}")]
    Rejected {
        notifier: String,
        description: String,
    },
    #[display("{notifier} is rate limiting, retry after {retry_after_secs}s")]
    RateLimited {
        notifier: String,
        retry_after_secs: u64,
    },
    #[display("{notifier} is unavailable: {description}")]
    Unavailable {
        notifier: String,
        description: String,
    },
}

/// Input-contract violations surfaced by the alert evaluator.
#[derive(Debug, Display, Error)]
pub enum EvaluationError {
    #[display("invalid observation for {instrument}: {reason}")]
    InvalidObservation { instrument: String, reason: String },
    #[display("invalid rule \"{rule}\": {reason}")]
    InvalidRule { rule: String, reason: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}
