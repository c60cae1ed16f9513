// =============================================================================
// Error taxonomy shared across the bbsbot engine
// =============================================================================
//
// Transport / Terminal / Protocol errors are recovered at the Session
// boundary.  PromptTimeout and Validation errors abort a single action step
// but never the bot.  SessionBusy indicates a programming bug (two operations
// in flight on one session) and aborts the bot.
// =============================================================================

use thiserror::Error;

/// All typed failure modes in the engine.
#[derive(Debug, Error)]
pub enum BotError {
    /// TCP-level failure: connect, read, write, or peer loss.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote end closed the connection.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Telnet option negotiation produced an inconsistent exchange.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A control sequence could not be interpreted and could not be skipped.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// A second read/send was attempted while one was already in flight.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// The expected prompt did not appear within the step deadline.
    #[error("prompt timeout: {0}")]
    PromptTimeout(String),

    /// A KV extraction constraint failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// No valid action is available for the current game state.
    #[error("strategy error: {0}")]
    Strategy(String),

    /// LLM call failed: timeout, non-JSON output, schema mismatch, or a
    /// provider-reported failure.
    #[error("llm error: {0}")]
    Llm(String),

    /// The per-session intervention budget is exhausted.
    #[error("intervention budget exceeded ({0} used)")]
    InterventionBudgetExceeded(u32),

    /// The account pool has no available account.
    #[error("no account available: {0}")]
    AccountUnavailable(String),

    /// Spawning or supervising a worker process failed.
    #[error("bot supervision error: {0}")]
    Supervision(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A referenced session or bot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else bubbling up from std / third-party code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    /// True when the error means the peer is gone and the session is dead.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Short machine-readable tag used in `error_type` fields of bot records
    /// and event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Disconnected(_) => "disconnected",
            Self::Protocol(_) => "protocol",
            Self::Terminal(_) => "terminal",
            Self::SessionBusy(_) => "session_busy",
            Self::PromptTimeout(_) => "prompt_timeout",
            Self::Validation(_) => "validation",
            Self::Strategy(_) => "strategy",
            Self::Llm(_) => "llm",
            Self::InterventionBudgetExceeded(_) => "intervention_budget",
            Self::AccountUnavailable(_) => "account_unavailable",
            Self::Supervision(_) => "supervision",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(BotError::Transport("x".into()).kind(), "transport");
        assert_eq!(BotError::Disconnected("x".into()).kind(), "disconnected");
        assert_eq!(BotError::SessionBusy("x".into()).kind(), "session_busy");
        assert_eq!(
            BotError::InterventionBudgetExceeded(20).kind(),
            "intervention_budget"
        );
    }

    #[test]
    fn disconnect_predicate() {
        assert!(BotError::Disconnected("peer".into()).is_disconnect());
        assert!(!BotError::Transport("refused".into()).is_disconnect());
    }
}
