use thiserror::Error;

/// Typed error hierarchy for the decision engine.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation. The variants map onto the four failure
/// categories the pipeline distinguishes:
///
/// - transient I/O (`Exchange`, `LlmUnavailable`, forwarded transport errors)
///   — retried or skipped for the current cycle;
/// - model contract violations (`ModelContract`) — terminal for the stage,
///   the symbol is dropped, never silently coerced;
/// - risk-guard rejections (`RiskRejected`) — domain-level "no trade", not a
///   fault;
/// - constraint rejections (`ConstraintRejected`) — a normal negative
///   decision with a structured reason.
#[derive(Error, Debug)]
pub enum EngineError {
    // -- Exchange I/O -------------------------------------------------------
    #[error("exchange returned HTTP {status}: {body}")]
    Exchange { status: u16, body: String },

    #[error("data source unavailable: {name}")]
    DataUnavailable { name: String },

    // -- Model pipeline -----------------------------------------------------
    #[error("model contract violation in {stage}: {reason}")]
    ModelContract { stage: &'static str, reason: String },

    #[error("llm endpoint unavailable: {reason}")]
    LlmUnavailable { reason: String },

    // -- Domain rejections --------------------------------------------------
    #[error("risk guard rejected trade: {reason}")]
    RiskRejected { reason: String },

    #[error("constraint rejected: {reason}")]
    ConstraintRejected { reason: String },

    // -- Trader -------------------------------------------------------------
    #[error("trader error: {reason}")]
    Trader { reason: String },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error is a normal negative outcome rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::RiskRejected { .. } | EngineError::ConstraintRejected { .. }
        )
    }

    pub fn contract(stage: &'static str, reason: impl Into<String>) -> Self {
        EngineError::ModelContract {
            stage,
            reason: reason.into(),
        }
    }
}
