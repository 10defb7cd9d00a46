//! Closed error taxonomies per component, per the propagation policy: errors
//! are classified at the boundary where they occur and never double as
//! control flow signals.

use thiserror::Error;

/// Errors returned by every `ExchangeAdapter` operation (§4.5, §7).
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("credential rejected by exchange: {0}")]
    Auth(String),
    #[error("rate limited by exchange, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },
    #[error("symbol unknown on this exchange: {0}")]
    Symbol(String),
    #[error("insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: f64, available: f64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("exchange rejected order, code={code}: {message}")]
    ExchangeReject { code: String, message: String },
}

impl ExchangeError {
    /// Transient errors are worth retrying with backoff; all others are terminal
    /// for the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::RateLimit { .. })
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            ExchangeError::Auth(_) => "auth_error",
            ExchangeError::RateLimit { .. } => "rate_limited",
            ExchangeError::Symbol(_) => "symbol_error",
            ExchangeError::InsufficientBalance { .. } => "insufficient_balance",
            ExchangeError::Transport(_) => "transport",
            ExchangeError::ExchangeReject { .. } => "exchange_rejected",
        }
    }
}

/// Outcome-level failure reasons recorded on an `ExecutionAttempt` (§3, §4.4).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error("quantity below exchange minimum notional")]
    BelowNotional,
    #[error("no open position to close")]
    NoPosition,
    #[error("subscriber already at max concurrent positions")]
    MaxPositionsReached,
    #[error("same-side position already open on this symbol")]
    DuplicatePosition,
    #[error("exchange rejected the order: {0}")]
    ExchangeRejected(String),
    #[error("transport failure after retry budget exhausted")]
    Transport,
    #[error("submission outcome could not be reconciled")]
    Ambiguous,
    #[error("bracket order attach failed, position unwound")]
    BracketAttach,
    #[error("credential unavailable or disabled")]
    CredentialUnavailable,
}

/// Skip reasons recorded when a subscriber is ineligible or pre-checks fail
/// before any exchange call is made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("quantity below exchange minimum notional")]
    BelowNotional,
    #[error("no open position to close")]
    NoPosition,
    #[error("subscriber is guardrail-paused")]
    GuardrailPaused,
    #[error("subscriber inactive or subscription expired")]
    SubscriberIneligible,
    #[error("no approved credential for this symbol's exchange")]
    NoApprovedCredential,
    #[error("not subscribed to this strategy")]
    StrategyNotSubscribed,
    #[error("same-side position already open on this symbol")]
    DuplicatePosition,
}

/// Invariant violations: programming-level bugs or races that must abort the
/// single affected task while preserving all other in-flight work.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("duplicate execution attempt detected for ({signal_id}, {subscriber_id})")]
    DuplicateAttempt { signal_id: String, subscriber_id: String },
    #[error("duplicate position detected mid-insert for {0:?}")]
    DuplicatePosition(crate::domain::models::PositionKey),
}
